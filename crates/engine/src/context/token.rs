//! Token accounting.
//!
//! Counting goes through a strategy chain: a precise, model-specific
//! counter if one is attached, then a general-purpose tokenizer, then the
//! `chars / 4` heuristic. [`TokenAccountant::count`] never fails.
//!
//! The primary strategy is chosen once by probing at construction. A
//! failure at count time falls through to the next strategy for that call
//! only; the primary changes on [`TokenAccountant::reconfigure`].

use std::sync::Arc;

use contextloom_config::TokenConfig;
use contextloom_core::error::{ContextError, TokenCountError};
use contextloom_core::message::Message;
use contextloom_core::provider::{PreciseTokenCounter, ToolDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Per-message cost of role names, delimiters and formatting markers.
pub const MESSAGE_OVERHEAD: usize = 4;

const PROBE_TEXT: &str = "fn probe() { return \"token accounting\"; }";

/// Which strategy produced a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStrategy {
    Precise,
    Tokenizer,
    Heuristic,
}

impl std::fmt::Display for TokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Precise => "precise",
            Self::Tokenizer => "tokenizer",
            Self::Heuristic => "heuristic",
        };
        write!(f, "{name}")
    }
}

/// A general-purpose tokenizer matched to the model family.
pub trait TextTokenizer: Send + Sync {
    fn encode_len(&self, text: &str) -> Result<usize, TokenCountError>;
}

/// HuggingFace `tokenizer.json` backed tokenizer.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self, TokenCountError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| TokenCountError::Tokenizer(format!("Failed to load tokenizer: {e}")))?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TextTokenizer for HfTokenizer {
    fn encode_len(&self, text: &str) -> Result<usize, TokenCountError> {
        self.inner
            .encode(text, false)
            .map(|encoding| encoding.len())
            .map_err(|e| TokenCountError::Tokenizer(e.to_string()))
    }
}

/// The character-length heuristic: one token per four characters.
pub fn heuristic_count(text: &str) -> usize {
    text.chars().count() / 4
}

/// Counts tokens with a fixed primary strategy and silent fallback.
#[derive(Clone)]
pub struct TokenAccountant {
    precise: Option<Arc<dyn PreciseTokenCounter>>,
    tokenizer: Option<Arc<dyn TextTokenizer>>,
    primary: TokenStrategy,
}

impl std::fmt::Debug for TokenAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAccountant")
            .field("precise", &self.precise.is_some())
            .field("tokenizer", &self.tokenizer.is_some())
            .field("primary", &self.primary)
            .finish()
    }
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::heuristic_only()
    }
}

impl TokenAccountant {
    /// Build an accountant and probe the attached strategies.
    pub fn new(
        precise: Option<Arc<dyn PreciseTokenCounter>>,
        tokenizer: Option<Arc<dyn TextTokenizer>>,
    ) -> Self {
        let mut accountant = Self {
            precise,
            tokenizer,
            primary: TokenStrategy::Heuristic,
        };
        accountant.primary = accountant.probe();
        accountant
    }

    pub fn heuristic_only() -> Self {
        Self::new(None, None)
    }

    /// Build from configuration, loading the tokenizer file when the
    /// `hf-tokenizer` feature is enabled.
    pub fn from_config(config: &TokenConfig, precise: Option<Arc<dyn PreciseTokenCounter>>) -> Self {
        Self::new(precise, load_tokenizer(config))
    }

    /// Replace the strategies and re-run the probe.
    pub fn reconfigure(
        &mut self,
        precise: Option<Arc<dyn PreciseTokenCounter>>,
        tokenizer: Option<Arc<dyn TextTokenizer>>,
    ) {
        self.precise = precise;
        self.tokenizer = tokenizer;
        self.primary = self.probe();
    }

    /// The primary strategy chosen at the last probe.
    pub fn strategy(&self) -> TokenStrategy {
        self.primary
    }

    /// Count tokens in `text`. Never fails.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chain: &[TokenStrategy] = match self.primary {
            TokenStrategy::Precise => &[
                TokenStrategy::Precise,
                TokenStrategy::Tokenizer,
                TokenStrategy::Heuristic,
            ],
            TokenStrategy::Tokenizer => &[TokenStrategy::Tokenizer, TokenStrategy::Heuristic],
            TokenStrategy::Heuristic => &[TokenStrategy::Heuristic],
        };
        for strategy in chain {
            match self.try_count(*strategy, text) {
                Ok(n) => return n,
                Err(e) => debug!(strategy = %strategy, error = %e, "Token count failed, falling back"),
            }
        }
        heuristic_count(text)
    }

    /// Message content plus tool call names and arguments plus overhead.
    pub fn count_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| self.count(&c.name) + self.count(&c.arguments))
            .sum();
        MESSAGE_OVERHEAD + self.count(&message.content) + calls
    }

    /// Tool schemas, counted as their JSON serialization.
    pub fn count_tools(&self, tools: &[ToolDefinition]) -> usize {
        tools
            .iter()
            .map(|t| self.count(&serde_json::to_string(t).unwrap_or_default()))
            .sum()
    }

    fn try_count(&self, strategy: TokenStrategy, text: &str) -> Result<usize, TokenCountError> {
        match strategy {
            TokenStrategy::Precise => match &self.precise {
                Some(counter) => counter.count_tokens(text),
                None => Err(TokenCountError::Unavailable("no precise counter attached".into())),
            },
            TokenStrategy::Tokenizer => match &self.tokenizer {
                Some(tokenizer) => tokenizer.encode_len(text),
                None => Err(TokenCountError::Unavailable("no tokenizer loaded".into())),
            },
            TokenStrategy::Heuristic => Ok(heuristic_count(text)),
        }
    }

    fn probe(&self) -> TokenStrategy {
        for strategy in [TokenStrategy::Precise, TokenStrategy::Tokenizer] {
            let attached = match strategy {
                TokenStrategy::Precise => self.precise.is_some(),
                _ => self.tokenizer.is_some(),
            };
            if !attached {
                continue;
            }
            match self.try_count(strategy, PROBE_TEXT) {
                Ok(_) => {
                    debug!(strategy = %strategy, "Token counting strategy selected");
                    return strategy;
                }
                Err(e) => {
                    let unavailable = ContextError::TokenCountingUnavailable {
                        strategy: strategy.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{unavailable}");
                }
            }
        }
        TokenStrategy::Heuristic
    }
}

#[cfg(feature = "hf-tokenizer")]
fn load_tokenizer(config: &TokenConfig) -> Option<Arc<dyn TextTokenizer>> {
    let path = config.tokenizer_file.as_ref()?;
    match HfTokenizer::from_file(path) {
        Ok(tokenizer) => Some(Arc::new(tokenizer)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Tokenizer unavailable");
            None
        }
    }
}

#[cfg(not(feature = "hf-tokenizer"))]
fn load_tokenizer(config: &TokenConfig) -> Option<Arc<dyn TextTokenizer>> {
    if let Some(path) = &config.tokenizer_file {
        debug!(
            path = %path.display(),
            "tokens.tokenizer_file set but built without the hf-tokenizer feature"
        );
    }
    None
}
