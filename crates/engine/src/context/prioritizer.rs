//! Content prioritizer.
//!
//! Scores every candidate item from five weighted factors (relevance,
//! recency, frequency, error priority, coherence) and buckets the score
//! into a [`PriorityTier`]. Items in an ACTIVE tool chain are promoted to
//! Critical; orphan tool results are halved and capped at Low.

use std::collections::{BTreeSet, HashMap};

use contextloom_config::ScoringConfig;
use contextloom_core::decision::{Decision, DecisionRecord, DecisionStage};
use contextloom_core::item::{ContextItem, ItemKind, PriorityTier};
use serde::Serialize;
use tracing::debug;

use super::signals;

/// The five sub-scores behind an item's priority, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriorityFactors {
    pub relevance: f64,
    pub recency: f64,
    pub frequency: f64,
    pub error: f64,
    pub coherence: f64,
}

impl PriorityFactors {
    fn as_array(&self) -> [f64; 5] {
        [
            self.relevance,
            self.recency,
            self.frequency,
            self.error,
            self.coherence,
        ]
    }
}

/// What an item is scored against: the current query and cycle-wide
/// statistics over the candidate items.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub query_keywords: BTreeSet<String>,
    pub query_files: Vec<String>,
    /// Files the conversation is currently about
    pub focus_files: Vec<String>,
    pub current_turn: u64,
    /// Number of items mentioning each file or function
    pub mentions: HashMap<String, usize>,
    /// Sequence and files of every error item
    pub error_sites: Vec<(usize, Vec<String>)>,
}

impl ScoringContext {
    pub fn build(items: &[ContextItem], query: Option<&str>, current_turn: u64) -> Self {
        let query_keywords = query.map(signals::keywords).unwrap_or_default();
        let query_files = query.map(signals::file_paths).unwrap_or_default();

        let focus_files = if query_files.is_empty() {
            items
                .iter()
                .rev()
                .find(|i| !i.metadata.file_paths.is_empty())
                .map(|i| i.metadata.file_paths.clone())
                .unwrap_or_default()
        } else {
            query_files.clone()
        };

        let mut mentions: HashMap<String, usize> = HashMap::new();
        for item in items {
            let entities: BTreeSet<&String> = item
                .metadata
                .file_paths
                .iter()
                .chain(item.metadata.function_names.iter())
                .collect();
            for entity in entities {
                *mentions.entry(entity.clone()).or_default() += 1;
            }
        }

        let error_sites = items
            .iter()
            .filter(|i| is_error_item(i))
            .map(|i| (i.sequence, i.metadata.file_paths.clone()))
            .collect();

        Self {
            query_keywords,
            query_files,
            focus_files,
            current_turn,
            mentions,
            error_sites,
        }
    }
}

fn is_error_item(item: &ContextItem) -> bool {
    item.metadata.error || signals::has_error_marker(&item.text)
}

// ── Prioritizer ───────────────────────────────────────────────────────────

pub struct ContentPrioritizer {
    config: ScoringConfig,
}

impl ContentPrioritizer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn factors(&self, item: &ContextItem, ctx: &ScoringContext) -> PriorityFactors {
        PriorityFactors {
            relevance: relevance(item, ctx),
            recency: self.recency(item, ctx.current_turn),
            frequency: frequency(item, ctx),
            error: error_priority(item, ctx),
            coherence: coherence(item, ctx),
        }
    }

    /// Composite score in `[0, 1]`: the weighted mean of the factors.
    pub fn score(&self, item: &ContextItem, ctx: &ScoringContext) -> f64 {
        let weights = self.config.weights.as_array();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = self
            .factors(item, ctx)
            .as_array()
            .iter()
            .zip(weights.iter())
            .map(|(f, w)| f * w)
            .sum();
        (weighted / total).clamp(0.0, 1.0)
    }

    /// Score and tier every item in place.
    pub fn prioritize(
        &self,
        items: &mut [ContextItem],
        ctx: &ScoringContext,
    ) -> Vec<DecisionRecord> {
        let scores: Vec<f64> = items.iter().map(|i| self.score(i, ctx)).collect();
        let mut decisions = Vec::new();
        for (item, score) in items.iter_mut().zip(scores) {
            self.assign(item, score, &mut decisions);
        }
        debug!(items = items.len(), "Items prioritized");
        decisions
    }

    /// Recency-only scoring, the fallback when correlation times out.
    pub fn prioritize_by_recency(
        &self,
        items: &mut [ContextItem],
        current_turn: u64,
    ) -> Vec<DecisionRecord> {
        let mut decisions = Vec::new();
        for item in items.iter_mut() {
            let score = self.recency(item, current_turn);
            self.assign(item, score, &mut decisions);
        }
        decisions
    }

    fn assign(&self, item: &mut ContextItem, score: f64, decisions: &mut Vec<DecisionRecord>) {
        let tiers = &self.config.tiers;
        let mut score = score;
        let mut tier = tiers.tier_for(score);

        if item.metadata.orphan {
            score *= self.config.orphan_penalty;
            tier = tiers.tier_for(score).max(PriorityTier::Low);
        }
        if item.in_active_chain() {
            if tier != PriorityTier::Critical {
                decisions.push(
                    DecisionRecord::new(
                        DecisionStage::Prioritizer,
                        item.id.clone(),
                        Decision::Promoted,
                        "active_chain",
                    )
                    .with_tier(PriorityTier::Critical),
                );
            }
            score = score.max(tiers.critical);
            tier = PriorityTier::Critical;
        }

        item.priority_score = score;
        item.priority_tier = tier;
    }

    fn recency(&self, item: &ContextItem, current_turn: u64) -> f64 {
        recency_score(
            current_turn.saturating_sub(item.turn_index),
            self.config.recency_window,
        )
    }
}

/// Indices of `items` by score descending; equal scores keep sequence
/// order, oldest first.
pub fn ranking(items: &[ContextItem]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| {
        items[*b]
            .priority_score
            .total_cmp(&items[*a].priority_score)
            .then(items[*a].sequence.cmp(&items[*b].sequence))
    });
    order
}

/// `exp(−3·age/window)` inside the window, zero beyond it.
pub fn recency_score(age: u64, window: u64) -> f64 {
    if window == 0 || age >= window {
        return 0.0;
    }
    (-3.0 * age as f64 / window as f64).exp()
}

// ── Factors ───────────────────────────────────────────────────────────────

fn relevance(item: &ContextItem, ctx: &ScoringContext) -> f64 {
    if item
        .metadata
        .file_paths
        .iter()
        .any(|f| ctx.query_files.contains(f))
    {
        return 1.0;
    }
    if ctx.query_keywords.is_empty() {
        return 0.0;
    }
    let keywords = signals::keywords(&item.text);
    let shared = ctx.query_keywords.intersection(&keywords).count();
    shared as f64 / ctx.query_keywords.len() as f64
}

fn frequency(item: &ContextItem, ctx: &ScoringContext) -> f64 {
    item.metadata
        .file_paths
        .iter()
        .chain(item.metadata.function_names.iter())
        .filter_map(|e| ctx.mentions.get(e))
        .map(|m| ((*m as f64 - 1.0) / 4.0).clamp(0.0, 1.0))
        .fold(0.0, f64::max)
}

fn error_priority(item: &ContextItem, ctx: &ScoringContext) -> f64 {
    if is_error_item(item) {
        return 1.0;
    }
    let fixes_earlier_error = signals::has_fix_marker(&item.text)
        && ctx.error_sites.iter().any(|(seq, files)| {
            *seq < item.sequence && files.iter().any(|f| item.metadata.file_paths.contains(f))
        });
    if fixes_earlier_error { 0.8 } else { 0.0 }
}

fn coherence(item: &ContextItem, ctx: &ScoringContext) -> f64 {
    if matches!(item.kind, ItemKind::Turn { injection: true, .. }) {
        return 1.0;
    }
    let files = &item.metadata.file_paths;
    if files.iter().any(|f| signals::is_config_file(f)) {
        return 1.0;
    }
    files
        .iter()
        .flat_map(|f| ctx.focus_files.iter().map(move |focus| proximity(f, focus)))
        .fold(0.0, f64::max)
}

/// Directory proximity of two paths.
fn proximity(a: &str, b: &str) -> f64 {
    let (da, db) = (signals::directory(a), signals::directory(b));
    if da == db {
        return 1.0;
    }
    if signals::directory(da) == db || signals::directory(db) == da {
        return 0.6;
    }
    let top = |d: &str| d.split('/').next().unwrap_or("").to_string();
    if !da.is_empty() && top(da) == top(db) {
        return 0.3;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use contextloom_core::item::{ChainState, ItemId, ItemMetadata};
    use contextloom_core::message::Role;

    fn item(seq: usize, turn: u64, text: &str) -> ContextItem {
        ContextItem {
            id: ItemId::message(turn, seq),
            kind: ItemKind::Turn {
                role: Role::Assistant,
                injection: false,
                tool_calls: vec![],
            },
            text: text.into(),
            token_count: 10,
            turn_index: turn,
            sequence: seq,
            timestamp: Utc::now(),
            priority_score: 0.0,
            priority_tier: PriorityTier::Minimal,
            metadata: ItemMetadata {
                file_paths: signals::file_paths(text),
                function_names: signals::function_names(text),
                ..Default::default()
            },
        }
    }

    fn prioritizer() -> ContentPrioritizer {
        ContentPrioritizer::new(ScoringConfig::default())
    }

    #[test]
    fn recency_decays_over_window() {
        assert_eq!(recency_score(0, 20), 1.0);
        assert!((recency_score(10, 20) - (-1.5f64).exp()).abs() < 1e-12);
        assert_eq!(recency_score(20, 20), 0.0);
        assert_eq!(recency_score(35, 20), 0.0);
    }

    #[test]
    fn query_file_match_is_full_relevance() {
        let items = vec![item(0, 1, "Opened auth.py"), item(1, 1, "Unrelated chatter")];
        let ctx = ScoringContext::build(&items, Some("why does auth.py fail"), 1);
        let p = prioritizer();
        assert_eq!(p.factors(&items[0], &ctx).relevance, 1.0);
        assert!(p.factors(&items[1], &ctx).relevance < 1.0);
    }

    #[test]
    fn keyword_coverage_relevance() {
        let items = vec![item(0, 1, "the login session expired")];
        let ctx = ScoringContext::build(&items, Some("login session timeout"), 1);
        let relevance = prioritizer().factors(&items[0], &ctx).relevance;
        assert!((relevance - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn frequency_counts_repeated_entities() {
        let items: Vec<ContextItem> = (0..5).map(|i| item(i, 1, "edit auth.py")).collect();
        let ctx = ScoringContext::build(&items, None, 1);
        assert_eq!(prioritizer().factors(&items[0], &ctx).frequency, 1.0);

        let single = vec![item(0, 1, "edit auth.py")];
        let ctx = ScoringContext::build(&single, None, 1);
        assert_eq!(prioritizer().factors(&single[0], &ctx).frequency, 0.0);
    }

    #[test]
    fn error_and_fix_priority() {
        let items = vec![
            item(0, 1, "Traceback in auth.py: KeyError"),
            item(1, 2, "Fixed the lookup in auth.py"),
            item(2, 2, "Fixed a typo in README.md"),
        ];
        let ctx = ScoringContext::build(&items, None, 2);
        let p = prioritizer();
        assert_eq!(p.factors(&items[0], &ctx).error, 1.0);
        assert_eq!(p.factors(&items[1], &ctx).error, 0.8);
        assert_eq!(p.factors(&items[2], &ctx).error, 0.0);
    }

    #[test]
    fn coherence_for_config_and_proximity() {
        let items = vec![
            item(0, 1, "bumped Cargo.toml"),
            item(1, 1, "src/auth/session.rs changed"),
            item(2, 1, "src/auth/tokens/jwt.rs changed"),
            item(3, 1, "docs/guide.md updated"),
        ];
        let ctx = ScoringContext::build(&items, Some("look at src/auth/login.rs"), 1);
        let p = prioritizer();
        assert_eq!(p.factors(&items[0], &ctx).coherence, 1.0);
        assert_eq!(p.factors(&items[1], &ctx).coherence, 1.0);
        assert_eq!(p.factors(&items[2], &ctx).coherence, 0.6);
        assert_eq!(p.factors(&items[3], &ctx).coherence, 0.0);
    }

    #[test]
    fn composite_is_weighted_mean() {
        let items = vec![item(0, 5, "hello there")];
        let ctx = ScoringContext::build(&items, None, 5);
        // Only recency (1.0) contributes: 0.25 / 1.0
        let score = prioritizer().score(&items[0], &ctx);
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn active_chain_promoted_orphan_capped() {
        let mut items = vec![item(0, 1, "old chatter"), item(1, 1, "auth.py auth.py")];
        items[0].metadata.chain_id = Some("chain-t1-m0".into());
        items[0].metadata.chain_state = Some(ChainState::Active);
        items[1].metadata.orphan = true;
        let ctx = ScoringContext::build(&items, Some("auth.py"), 1);

        let decisions = prioritizer().prioritize(&mut items, &ctx);
        assert_eq!(items[0].priority_tier, PriorityTier::Critical);
        assert!(items[0].priority_score >= 0.8);
        assert!(items[1].priority_tier >= PriorityTier::Low);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, Decision::Promoted);
    }

    #[test]
    fn ranking_breaks_ties_by_sequence() {
        let mut items = vec![item(0, 1, "a"), item(1, 1, "b"), item(2, 1, "c")];
        items[0].priority_score = 0.5;
        items[1].priority_score = 0.9;
        items[2].priority_score = 0.5;
        assert_eq!(ranking(&items), vec![1, 0, 2]);
    }

    #[test]
    fn recency_only_fallback() {
        let mut items = vec![item(0, 1, "auth.py"), item(1, 10, "later")];
        prioritizer().prioritize_by_recency(&mut items, 10);
        assert_eq!(items[1].priority_score, 1.0);
        assert!(items[0].priority_score < items[1].priority_score);
    }
}
