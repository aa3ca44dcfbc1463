//! Bridge builder.
//!
//! When a cluster cannot be fully included, its excluded members are
//! replaced by one compact synthesized item that keeps the dependency
//! visible. Text comes from deterministic templates; a bridge never costs
//! more than `compression_ratio` of what it replaces.

use std::collections::BTreeSet;

use contextloom_config::{BridgeConfig, ContextStrategy};
use contextloom_core::item::{ContextItem, ItemId, ItemKind, ItemMetadata, PriorityTier};
use contextloom_core::message::Role;
use contextloom_core::reference::{BridgeType, ReferenceStrength};
use tracing::debug;

use super::signals;
use super::token::{MESSAGE_OVERHEAD, TokenAccountant};

/// The excluded part of one cluster, as seen by the bridge builder.
#[derive(Debug, Clone)]
pub struct ExcludedCluster<'a> {
    pub cluster_id: usize,
    /// Excluded members in sequence order
    pub items: Vec<&'a ContextItem>,
    pub tier: PriorityTier,
    /// Strongest reference inside the cluster
    pub max_strength: Option<ReferenceStrength>,
    /// Some members made it into the context
    pub partially_admitted: bool,
    /// Strongest reference from an included member to an excluded one
    pub crossing_strength: Option<ReferenceStrength>,
    /// The excluded members hold an error→fix reference
    pub has_error_fix: bool,
    /// The excluded members share files or functions with included items
    pub shared_with_included: bool,
}

impl ExcludedCluster<'_> {
    pub fn tokens(&self) -> usize {
        self.items.iter().map(|i| i.token_count).sum()
    }
}

pub struct BridgeBuilder {
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn with_strategy(mut self, strategy: ContextStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.config.strategy
    }

    /// Whether the active strategy wants a bridge for this cluster.
    pub fn should_bridge(&self, cluster: &ExcludedCluster<'_>) -> bool {
        let at_least = |floor| cluster.max_strength.is_some_and(|s| s.at_least(floor));
        match self.config.strategy {
            ContextStrategy::Conservative => at_least(ReferenceStrength::Critical),
            ContextStrategy::Moderate => {
                at_least(ReferenceStrength::Strong) || cluster.tier <= PriorityTier::Medium
            }
            ContextStrategy::Aggressive => true,
            ContextStrategy::DependencyOnly => {
                cluster.partially_admitted
                    && cluster
                        .crossing_strength
                        .is_some_and(|s| s.at_least(ReferenceStrength::Strong))
            }
        }
    }

    pub fn select_type(&self, cluster: &ExcludedCluster<'_>) -> BridgeType {
        if cluster.items.iter().any(|i| i.metadata.chain_id.is_some()) {
            BridgeType::ToolChainSummary
        } else if cluster.has_error_fix {
            BridgeType::ErrorContextLink
        } else if cluster.shared_with_included {
            BridgeType::ReferenceContinuity
        } else if cluster
            .items
            .iter()
            .all(|i| matches!(i.kind, ItemKind::Turn { .. } | ItemKind::CodeSnippet { .. }))
        {
            BridgeType::ConversationFlow
        } else {
            BridgeType::GenericSummary
        }
    }

    /// Tokens to hold back so a cluster of `original` tokens can still be
    /// bridged.
    pub fn reserve_for(&self, original: usize) -> usize {
        self.ratio_cap(original).max(self.config.min_bridge_tokens)
    }

    /// Build the bridge, or `None` when nothing useful fits.
    pub fn bridge(
        &self,
        cluster: &ExcludedCluster<'_>,
        remaining: usize,
        tokens: &TokenAccountant,
    ) -> Option<ContextItem> {
        if cluster.items.is_empty() {
            return None;
        }
        let original = cluster.tokens();
        let cap = remaining.min(self.ratio_cap(original));
        if cap < self.config.min_bridge_tokens {
            debug!(cluster = cluster.cluster_id, cap, "No room for a bridge");
            return None;
        }

        let bridge_type = self.select_type(cluster);
        let template = render(bridge_type, cluster);
        let cost = |text: &str| tokens.count(text) + MESSAGE_OVERHEAD;

        let text = if cost(&template.full) <= cap {
            template.full
        } else {
            // Compact form: header plus as many names as fit
            let mut names = template.names;
            loop {
                let compact = if names.is_empty() {
                    template.header.clone()
                } else {
                    format!("{}: {}", template.header, names.join(", "))
                };
                if cost(&compact) <= cap {
                    break compact;
                }
                if names.pop().is_none() {
                    debug!(cluster = cluster.cluster_id, cap, "Bridge header alone exceeds cap");
                    return None;
                }
            }
        };

        let token_count = cost(&text);
        Some(assemble_item(cluster, bridge_type, text, token_count))
    }

    fn ratio_cap(&self, original: usize) -> usize {
        // Tolerate float noise so 1000 × 0.1 caps at 100, not 101
        (original as f64 * self.config.compression_ratio - 1e-9).ceil().max(0.0) as usize
    }
}

// ── Templates ─────────────────────────────────────────────────────────────

struct Template {
    full: String,
    header: String,
    names: Vec<String>,
}

fn render(bridge_type: BridgeType, cluster: &ExcludedCluster<'_>) -> Template {
    let files = collect(cluster, |i| i.metadata.file_paths.clone());
    let functions = collect(cluster, |i| i.metadata.function_names.clone());
    let n = cluster.items.len();

    match bridge_type {
        BridgeType::ToolChainSummary => {
            let steps: Vec<String> = cluster
                .items
                .iter()
                .filter_map(|i| match &i.kind {
                    ItemKind::ToolResult { tool_name, .. } => {
                        let target = i.metadata.file_paths.first().map(String::as_str).unwrap_or("");
                        let status = if i.metadata.error { " failed" } else { "" };
                        Some(format!("{tool_name} {target}{status}").trim_end().to_string())
                    }
                    _ => None,
                })
                .collect();
            let tools = collect(cluster, |i| i.metadata.tool_names.clone());
            Template {
                full: format!(
                    "[Earlier tool chain, {n} items omitted] {}",
                    if steps.is_empty() { tools.join(", ") } else { steps.join("; ") }
                ),
                header: "[Earlier tool chain omitted]".into(),
                names: tools,
            }
        }
        BridgeType::ErrorContextLink => {
            let error = cluster
                .items
                .iter()
                .find(|i| i.metadata.error)
                .map(|i| first_line(&i.text))
                .unwrap_or_default();
            let fix = cluster
                .items
                .iter()
                .rev()
                .find(|i| signals::has_fix_marker(&i.text))
                .map(|i| first_line(&i.text))
                .unwrap_or_default();
            Template {
                full: format!("[Earlier error and fix omitted] Error: {error} Fix: {fix}"),
                header: "[Earlier error resolved]".into(),
                names: files,
            }
        }
        BridgeType::ReferenceContinuity => {
            let mut names = files;
            names.extend(functions);
            Template {
                full: format!(
                    "[Earlier discussion omitted, {n} items] It covered {}.",
                    names.join(", ")
                ),
                header: "[Earlier discussion omitted]".into(),
                names,
            }
        }
        BridgeType::ConversationFlow => {
            let lines: Vec<String> = cluster
                .items
                .iter()
                .filter_map(|i| match &i.kind {
                    ItemKind::Turn { role, .. } => {
                        let who = if *role == Role::User { "user" } else { "assistant" };
                        Some(format!("{who}: {}", signals::first_words(&i.text, 12)))
                    }
                    _ => None,
                })
                .collect();
            Template {
                full: format!("[Earlier exchange omitted] {}", lines.join(" / ")),
                header: "[Earlier exchange omitted]".into(),
                names: top_keywords(cluster, 6),
            }
        }
        BridgeType::GenericSummary => {
            let keywords = top_keywords(cluster, 8);
            Template {
                full: format!("[{n} earlier items omitted] Topics: {}", keywords.join(", ")),
                header: "[Earlier items omitted]".into(),
                names: keywords,
            }
        }
    }
}

fn assemble_item(
    cluster: &ExcludedCluster<'_>,
    bridge_type: BridgeType,
    text: String,
    token_count: usize,
) -> ContextItem {
    let first = cluster.items.iter().min_by_key(|i| i.sequence);
    let covers: Vec<ItemId> = cluster.items.iter().map(|i| i.id.clone()).collect();
    ContextItem {
        id: ItemId::bridge(cluster.cluster_id),
        kind: ItemKind::Bridge { bridge_type, covers },
        text,
        token_count,
        turn_index: first.map(|i| i.turn_index).unwrap_or(0),
        sequence: first.map(|i| i.sequence).unwrap_or(0),
        timestamp: first.map(|i| i.timestamp).unwrap_or_else(chrono::Utc::now),
        priority_score: cluster
            .items
            .iter()
            .map(|i| i.priority_score)
            .fold(0.0, f64::max),
        priority_tier: cluster.tier,
        metadata: ItemMetadata {
            file_paths: collect(cluster, |i| i.metadata.file_paths.clone()),
            function_names: collect(cluster, |i| i.metadata.function_names.clone()),
            tool_names: collect(cluster, |i| i.metadata.tool_names.clone()),
            error: cluster.items.iter().any(|i| i.metadata.error),
            ..Default::default()
        },
    }
}

/// Distinct values in first-seen order.
fn collect(cluster: &ExcludedCluster<'_>, f: impl Fn(&ContextItem) -> Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    cluster
        .items
        .iter()
        .flat_map(|i| f(i))
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Most frequent keywords, ties alphabetical.
fn top_keywords(cluster: &ExcludedCluster<'_>, n: usize) -> Vec<String> {
    let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
    for item in &cluster.items {
        for word in signals::keywords(&item.text) {
            *counts.entry(word).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

fn first_line(text: &str) -> String {
    signals::first_words(text.lines().find(|l| !l.trim().is_empty()).unwrap_or(""), 16)
}
