//! Configuration loading, validation, and management for contextloom.
//!
//! Loads configuration from `~/.contextloom/config.toml` with environment
//! variable overrides. Validates all settings at load time. Every default
//! here is the value the engine's contracts are specified and tested
//! against; change them in the TOML file, not in code.

use contextloom_core::item::PriorityTier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The root configuration structure.
///
/// Maps directly to `~/.contextloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Target model and its context window
    #[serde(default)]
    pub model: ModelConfig,

    /// Token accounting strategies
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Budget computation and safety margins
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Content prioritizer weights and tier thresholds
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Dependency correlator weights and limits
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Context assembler tier reservations and policies
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Bridge builder strategy and compression
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Progressive optimizer retry and reduction settings
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Decision record emission
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Reference conversation store settings
    #[serde(default)]
    pub store: StoreConfig,
}

// ── Model ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,

    /// Total context window in tokens
    pub context_limit: usize,

    /// Maximum tokens per response, forwarded to the client
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-4".into(),
            context_limit: 200_000,
            max_output_tokens: 4096,
        }
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HuggingFace `tokenizer.json` for the model family. Only used when
    /// the engine is built with the `hf-tokenizer` feature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer_file: Option<PathBuf>,
}

// ── Budget ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Safety margins, largest first; pressure level N selects index N.
    pub safety_margins: Vec<usize>,

    /// Minimum history budget; when even this does not fit, only the
    /// mandatory elements are sent.
    pub emergency_floor: usize,

    /// Allowed overshoot of the available budget (fraction).
    pub tolerance: f64,

    /// First-pass utilization above which pressure retention applies.
    pub pressure_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            safety_margins: vec![2000, 1000, 500, 200, 50],
            emergency_floor: 50,
            tolerance: 0.05,
            pressure_threshold: 0.8,
        }
    }
}

// ── Scoring ───────────────────────────────────────────────────────────────

/// Weights of the prioritizer's composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub relevance: f64,
    pub recency: f64,
    pub frequency: f64,
    pub error: f64,
    pub coherence: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            relevance: 0.35,
            recency: 0.25,
            frequency: 0.15,
            error: 0.15,
            coherence: 0.10,
        }
    }
}

impl PriorityWeights {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.relevance,
            self.recency,
            self.frequency,
            self.error,
            self.coherence,
        ]
    }
}

/// Lower score bounds of each tier; anything below `low` is Minimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            critical: 0.8,
            high: 0.6,
            medium: 0.4,
            low: 0.2,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, score: f64) -> PriorityTier {
        if score >= self.critical {
            PriorityTier::Critical
        } else if score >= self.high {
            PriorityTier::High
        } else if score >= self.medium {
            PriorityTier::Medium
        } else if score >= self.low {
            PriorityTier::Low
        } else {
            PriorityTier::Minimal
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: PriorityWeights,

    /// Recency decay window in turns
    pub recency_window: u64,

    pub tiers: TierThresholds,

    /// Multiplier applied to orphan tool results
    pub orphan_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            recency_window: 20,
            tiers: TierThresholds::default(),
            orphan_penalty: 0.5,
        }
    }
}

// ── Correlation ───────────────────────────────────────────────────────────

/// Weights of the correlator's pairwise reference score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationWeights {
    pub file: f64,
    pub content: f64,
    pub temporal: f64,
    pub tool_sequence: f64,
    pub error: f64,
}

impl Default for CorrelationWeights {
    fn default() -> Self {
        Self {
            file: 0.30,
            content: 0.25,
            temporal: 0.20,
            tool_sequence: 0.15,
            error: 0.10,
        }
    }
}

impl CorrelationWeights {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.file,
            self.content,
            self.temporal,
            self.tool_sequence,
            self.error,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub weights: CorrelationWeights,

    /// Pairs must score strictly above this to become edges.
    pub edge_threshold: f64,

    /// Turn distance at which temporal proximity bottoms out at 0.1
    pub temporal_window: u64,

    /// Content similarity that counts as evidence on its own
    pub min_content_evidence: f64,

    /// Above this many items, skip the pairwise pass entirely.
    pub max_items: usize,

    /// Wall-clock budget for the pairwise pass; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_budget_ms: Option<u64>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            weights: CorrelationWeights::default(),
            edge_threshold: 0.1,
            temporal_window: 20,
            min_content_evidence: 0.25,
            max_items: 600,
            time_budget_ms: Some(2_000),
        }
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────

/// Fraction of the available budget reserved for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierReservations {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub minimal: f64,
}

impl Default for TierReservations {
    fn default() -> Self {
        Self {
            critical: 0.40,
            high: 0.25,
            medium: 0.20,
            low: 0.10,
            minimal: 0.05,
        }
    }
}

impl TierReservations {
    pub fn for_tier(&self, tier: PriorityTier) -> f64 {
        match tier {
            PriorityTier::Critical => self.critical,
            PriorityTier::High => self.high,
            PriorityTier::Medium => self.medium,
            PriorityTier::Low => self.low,
            PriorityTier::Minimal => self.minimal,
        }
    }

    pub fn total(&self) -> f64 {
        PriorityTier::ALL.iter().map(|t| self.for_tier(*t)).sum()
    }
}

/// What to do when an active tool chain alone exceeds the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveChainPolicy {
    /// Include the chain anyway and flag the context as over budget.
    #[default]
    Override,
    /// Raise `ChainExceedsBudget`.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub tier_reservations: TierReservations,
    pub active_chain_policy: ActiveChainPolicy,

    /// Admit part of a cluster that does not fit whole, bridging the rest.
    pub allow_partial_clusters: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            tier_reservations: TierReservations::default(),
            active_chain_policy: ActiveChainPolicy::Override,
            allow_partial_clusters: true,
        }
    }
}

// ── Bridges ───────────────────────────────────────────────────────────────

/// How aggressively excluded content is replaced by bridges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Bridge only clusters holding a critical-strength reference; under
    /// pressure keep only active chains and the latest segments.
    Conservative,
    #[default]
    Moderate,
    /// Bridge every excluded cluster.
    Aggressive,
    /// Bridge only to keep references from included content intact.
    DependencyOnly,
}

impl FromStr for ContextStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "conservative" => Ok(Self::Conservative),
            "moderate" => Ok(Self::Moderate),
            "aggressive" => Ok(Self::Aggressive),
            "dependency_only" | "dependency" => Ok(Self::DependencyOnly),
            other => Err(ConfigError::ValidationError(format!(
                "unknown strategy '{other}' (expected conservative, moderate, aggressive, dependency_only)"
            ))),
        }
    }
}

impl std::fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::DependencyOnly => "dependency_only",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub strategy: ContextStrategy,

    /// Maximum bridge cost as a fraction of the content it replaces
    pub compression_ratio: f64,

    /// Bridges smaller than this are not worth emitting
    pub min_bridge_tokens: usize,

    /// Completed segments kept by the conservative strategy under pressure
    pub conservative_recent_segments: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Moderate,
            compression_ratio: 0.10,
            min_bridge_tokens: 8,
            conservative_recent_segments: 2,
        }
    }
}

// ── Optimizer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,

    /// Hard wall-clock limit per attempt
    pub attempt_timeout_secs: u64,

    /// Consecutive failures of the same class that trip the breaker
    pub max_consecutive_errors: u32,

    pub moderate_turns: usize,
    pub moderate_snippets: usize,
    pub aggressive_turns: usize,
    pub aggressive_snippets: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
            attempt_timeout_secs: 300,
            max_consecutive_errors: 3,
            moderate_turns: 3,
            moderate_snippets: 3,
            aggressive_turns: 1,
            aggressive_snippets: 0,
        }
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,

    /// Capacity of the non-blocking channel sink
    pub channel_capacity: usize,

    /// Records kept by the in-memory sink before pruning
    pub memory_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1024,
            memory_capacity: 10_000,
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "in_memory" or "json_file"
    pub backend: String,

    /// Directory for the JSON file store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    pub max_stored_turns: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "in_memory".into(),
            path: None,
            max_stored_turns: 500,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.contextloom/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CONTEXTLOOM_MODEL`
    /// - `CONTEXTLOOM_CONTEXT_LIMIT`
    /// - `CONTEXTLOOM_STRATEGY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("CONTEXTLOOM_MODEL") {
            self.model.name = model;
        }

        if let Ok(limit) = std::env::var("CONTEXTLOOM_CONTEXT_LIMIT") {
            self.model.context_limit = limit.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CONTEXTLOOM_CONTEXT_LIMIT must be a positive integer, got '{limit}'"
                ))
            })?;
        }

        if let Ok(strategy) = std::env::var("CONTEXTLOOM_STRATEGY") {
            self.bridge.strategy = strategy.parse()?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".contextloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.context_limit == 0 {
            return Err(ConfigError::ValidationError(
                "model.context_limit must be > 0".into(),
            ));
        }

        check_weights("scoring.weights", &self.scoring.weights.as_array())?;
        check_weights("correlation.weights", &self.correlation.weights.as_array())?;

        let t = &self.scoring.tiers;
        if !(t.critical > t.high && t.high > t.medium && t.medium > t.low && t.low >= 0.0) {
            return Err(ConfigError::ValidationError(
                "scoring.tiers thresholds must be strictly decreasing from critical to low".into(),
            ));
        }

        let reservations = &self.assembly.tier_reservations;
        if PriorityTier::ALL
            .iter()
            .any(|tier| reservations.for_tier(*tier) < 0.0)
            || reservations.total() > 1.0 + f64::EPSILON
        {
            return Err(ConfigError::ValidationError(
                "assembly.tier_reservations must be non-negative and sum to at most 1.0".into(),
            ));
        }

        let margins = &self.budget.safety_margins;
        if margins.is_empty() || margins.windows(2).any(|w| w[0] < w[1]) {
            return Err(ConfigError::ValidationError(
                "budget.safety_margins must be non-empty and non-increasing".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.budget.tolerance)
            || !(0.0..=1.0).contains(&self.budget.pressure_threshold)
        {
            return Err(ConfigError::ValidationError(
                "budget.tolerance and budget.pressure_threshold must be within [0, 1]".into(),
            ));
        }

        if !(self.bridge.compression_ratio > 0.0 && self.bridge.compression_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "bridge.compression_ratio must be within (0, 1]".into(),
            ));
        }

        if self.optimizer.max_retries == 0 || self.optimizer.max_consecutive_errors == 0 {
            return Err(ConfigError::ValidationError(
                "optimizer.max_retries and optimizer.max_consecutive_errors must be >= 1".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.optimizer.jitter) || self.optimizer.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "optimizer.jitter must be within [0, 1) and backoff_multiplier >= 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_weights(name: &str, weights: &[f64]) -> Result<(), ConfigError> {
    if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
        return Err(ConfigError::ValidationError(format!(
            "{name} must each be within [0, 1]"
        )));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "{name} must sum to more than 0"
        )));
    }
    Ok(())
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget.safety_margins, vec![2000, 1000, 500, 200, 50]);
        assert_eq!(config.bridge.strategy, ContextStrategy::Moderate);
        assert_eq!(
            config.assembly.active_chain_policy,
            ActiveChainPolicy::Override
        );
    }

    #[test]
    fn default_weights_match_contract() {
        let w = PriorityWeights::default();
        assert_eq!(w.as_array(), [0.35, 0.25, 0.15, 0.15, 0.10]);
        let c = CorrelationWeights::default();
        assert_eq!(c.as_array(), [0.30, 0.25, 0.20, 0.15, 0.10]);
        assert!((w.as_array().iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.context_limit, config.model.context_limit);
        assert_eq!(parsed.scoring.weights, config.scoring.weights);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[model]
context_limit = 8000

[bridge]
strategy = "conservative"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model.context_limit, 8000);
        assert_eq!(config.model.name, "claude-sonnet-4");
        assert_eq!(config.bridge.strategy, ContextStrategy::Conservative);
        assert_eq!(config.bridge.conservative_recent_segments, 2);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().model.context_limit, 200_000);
    }

    #[test]
    fn unparsable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn increasing_margins_rejected() {
        let mut config = AppConfig::default();
        config.budget.safety_margins = vec![50, 2000];
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversubscribed_reservations_rejected() {
        let mut config = AppConfig::default();
        config.assembly.tier_reservations.critical = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_weights_rejected() {
        let mut config = AppConfig::default();
        config.scoring.weights = PriorityWeights {
            relevance: 0.0,
            recency: 0.0,
            frequency: 0.0,
            error: 0.0,
            coherence: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tier_thresholds_bucket_scores() {
        let t = TierThresholds::default();
        assert_eq!(t.tier_for(0.95), PriorityTier::Critical);
        assert_eq!(t.tier_for(0.6), PriorityTier::High);
        assert_eq!(t.tier_for(0.45), PriorityTier::Medium);
        assert_eq!(t.tier_for(0.2), PriorityTier::Low);
        assert_eq!(t.tier_for(0.05), PriorityTier::Minimal);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "Dependency-Only".parse::<ContextStrategy>().unwrap(),
            ContextStrategy::DependencyOnly
        );
        assert_eq!(
            "aggressive".parse::<ContextStrategy>().unwrap(),
            ContextStrategy::Aggressive
        );
        assert!("reckless".parse::<ContextStrategy>().is_err());
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("context_limit"));
        assert!(toml_str.contains("moderate"));
    }
}
