//! Dependency correlator.
//!
//! Builds a typed reference graph over the cycle's items and clusters it
//! into connected components. Items live in an index arena (the slice the
//! caller passes in); references address them by index and the graph is
//! an adjacency list over those indices, so cycles cost nothing and the
//! traversal is an explicit-stack loop.
//!
//! Two kinds of edges exist:
//!
//! - **Scored** edges from the five weighted factors. A pair must score
//!   above the edge threshold *and* carry real evidence (a file, content,
//!   tool-sequence or error signal); temporal proximity alone never links
//!   two items.
//! - **Structural** edges at confidence 1.0 for tool-chain membership,
//!   snippet ↔ parent, and consecutive items of one segment.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use contextloom_config::CorrelationConfig;
use contextloom_core::decision::{Decision, DecisionRecord, DecisionStage};
use contextloom_core::error::ContextError;
use contextloom_core::item::{ContextItem, ItemKind, PriorityTier};
use contextloom_core::reference::{Reference, ReferenceFactors, ReferenceStrength, ReferenceType};
use serde::Serialize;
use tracing::{debug, warn};

use super::signals::{self, ToolAction};

/// A connected component of the reference graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyCluster {
    pub id: usize,
    /// Item indices, ascending
    pub members: Vec<usize>,
    /// Highest member priority score
    pub aggregate_priority: f64,
    pub tier: PriorityTier,
    /// Strongest reference inside the cluster
    pub max_strength: Option<ReferenceStrength>,
    pub has_active_chain: bool,
    pub earliest_turn: u64,
    pub token_count: usize,
}

/// References and clusters for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CorrelationResult {
    pub references: Vec<Reference>,
    pub clusters: Vec<DependencyCluster>,
    /// Set when the pairwise pass was skipped or abandoned
    pub timeout: Option<ContextError>,
    /// One `Demoted` record per item when the timeout fallback applies
    pub decisions: Vec<DecisionRecord>,
}

// ── Graph ─────────────────────────────────────────────────────────────────

/// Undirected adjacency list over item indices.
#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    adjacency: Vec<Vec<usize>>,
}

impl ReferenceGraph {
    pub fn new(node_count: usize, references: &[Reference]) -> Self {
        let mut adjacency = vec![Vec::new(); node_count];
        for r in references {
            if r.source < node_count && r.target < node_count {
                adjacency[r.source].push(r.target);
                adjacency[r.target].push(r.source);
            }
        }
        Self { adjacency }
    }

    pub fn neighbors(&self, node: usize) -> &[usize] {
        &self.adjacency[node]
    }

    /// Connected components, each sorted, ordered by smallest member.
    pub fn components(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.adjacency.len()];
        let mut components = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.adjacency.len() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            stack.push(start);
            let mut component = Vec::new();
            while let Some(node) = stack.pop() {
                component.push(node);
                for next in &self.adjacency[node] {
                    if !seen[*next] {
                        seen[*next] = true;
                        stack.push(*next);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components
    }
}

// ── Features ──────────────────────────────────────────────────────────────

struct Features {
    files: Vec<String>,
    keywords: BTreeSet<String>,
    constructs: BTreeSet<String>,
    functions: BTreeSet<String>,
    action: Option<ToolAction>,
    error: bool,
    fix: bool,
    turn: u64,
}

impl Features {
    fn of(item: &ContextItem) -> Self {
        let action = item
            .metadata
            .tool_names
            .iter()
            .map(|t| signals::classify_tool(t))
            .find(|a| *a != ToolAction::Other)
            .or_else(|| (!item.metadata.tool_names.is_empty()).then_some(ToolAction::Other));
        Self {
            files: item.metadata.file_paths.clone(),
            keywords: signals::keywords(&item.text),
            constructs: signals::constructs(&item.text),
            functions: item.metadata.function_names.iter().cloned().collect(),
            action,
            error: item.metadata.error || signals::has_error_marker(&item.text),
            fix: signals::has_fix_marker(&item.text),
            turn: item.turn_index,
        }
    }

    fn shares_file(&self, other: &Features) -> bool {
        self.files.iter().any(|f| other.files.contains(f))
    }
}

/// Similarity of two file paths.
pub fn file_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let dir = signals::directory(a);
    if !dir.is_empty() && dir == signals::directory(b) {
        return 0.6;
    }
    if signals::basename(a) == signals::basename(b) {
        return 0.5;
    }
    match (signals::extension_group(a), signals::extension_group(b)) {
        (Some(x), Some(y)) if x == y => 0.2,
        _ => 0.0,
    }
}

// ── Correlator ────────────────────────────────────────────────────────────

pub struct DependencyCorrelator {
    config: CorrelationConfig,
}

impl DependencyCorrelator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    /// Compute references and clusters over `items`.
    pub fn correlate(&self, items: &[ContextItem]) -> CorrelationResult {
        let started = Instant::now();
        let mut edges: BTreeMap<(usize, usize), Reference> = BTreeMap::new();

        let timeout = if items.len() > self.config.max_items {
            Some(ContextError::CorrelationTimeout {
                items: items.len(),
                elapsed_ms: 0,
            })
        } else {
            self.pairwise(items, started, &mut edges)
        };
        let mut decisions = Vec::new();
        if let Some(err) = &timeout {
            warn!("{err}; falling back to structural references");
            edges.clear();
            decisions = items
                .iter()
                .map(|item| {
                    DecisionRecord::new(
                        DecisionStage::Correlator,
                        item.id.clone(),
                        Decision::Demoted,
                        "correlation_timeout",
                    )
                })
                .collect();
        }

        self.structural(items, &mut edges);

        let references: Vec<Reference> = edges.into_values().collect();
        let clusters = self.cluster(items, &references);
        debug!(
            items = items.len(),
            references = references.len(),
            clusters = clusters.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Items correlated"
        );
        CorrelationResult {
            references,
            clusters,
            timeout,
            decisions,
        }
    }

    /// The five sub-scores for an ordered pair (`a` earlier than `b`).
    pub fn factors(&self, a: &ContextItem, b: &ContextItem) -> ReferenceFactors {
        self.pair_factors(&Features::of(a), &Features::of(b))
    }

    /// Weighted score of a factor set, normalised by the weight sum.
    pub fn score(&self, factors: &ReferenceFactors) -> f64 {
        let weights = self.config.weights.as_array();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let values = [
            factors.file_similarity,
            factors.content_similarity,
            factors.temporal_proximity,
            factors.tool_sequence,
            factors.error_continuation,
        ];
        let weighted: f64 = values.iter().zip(weights.iter()).map(|(v, w)| v * w).sum();
        (weighted / total).clamp(0.0, 1.0)
    }

    /// Group items into clusters along `references`.
    pub fn cluster(&self, items: &[ContextItem], references: &[Reference]) -> Vec<DependencyCluster> {
        let graph = ReferenceGraph::new(items.len(), references);
        let components = graph.components();

        let mut component_of = vec![0usize; items.len()];
        for (c, members) in components.iter().enumerate() {
            for m in members {
                component_of[*m] = c;
            }
        }
        let mut max_strength: Vec<Option<ReferenceStrength>> = vec![None; components.len()];
        for r in references {
            let c = component_of[r.source];
            max_strength[c] = Some(match max_strength[c] {
                Some(s) => s.min(r.strength),
                None => r.strength,
            });
        }

        components
            .into_iter()
            .enumerate()
            .map(|(id, members)| {
                let aggregate_priority = members
                    .iter()
                    .map(|m| items[*m].priority_score)
                    .fold(0.0, f64::max);
                let has_active_chain = members.iter().any(|m| items[*m].in_active_chain());
                let tier = if has_active_chain {
                    PriorityTier::Critical
                } else {
                    members
                        .iter()
                        .map(|m| items[*m].priority_tier)
                        .min()
                        .unwrap_or(PriorityTier::Minimal)
                };
                DependencyCluster {
                    id,
                    aggregate_priority,
                    tier,
                    max_strength: max_strength[id],
                    has_active_chain,
                    earliest_turn: members
                        .iter()
                        .map(|m| items[*m].turn_index)
                        .min()
                        .unwrap_or(0),
                    token_count: members.iter().map(|m| items[*m].token_count).sum(),
                    members,
                }
            })
            .collect()
    }

    // ── Edges ──

    fn pairwise(
        &self,
        items: &[ContextItem],
        started: Instant,
        edges: &mut BTreeMap<(usize, usize), Reference>,
    ) -> Option<ContextError> {
        let features: Vec<Features> = items.iter().map(Features::of).collect();
        let budget = self.config.time_budget_ms.map(Duration::from_millis);

        for i in 0..items.len() {
            if let Some(limit) = budget
                && started.elapsed() > limit
            {
                return Some(ContextError::CorrelationTimeout {
                    items: items.len(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            for j in (i + 1)..items.len() {
                let factors = self.pair_factors(&features[i], &features[j]);
                if !self.has_evidence(&factors) {
                    continue;
                }
                let confidence = self.score(&factors);
                if confidence <= self.config.edge_threshold {
                    continue;
                }
                let reference_type = dominant_type(&factors, &features[i], &features[j]);
                edges.insert(
                    (i, j),
                    Reference {
                        source: i,
                        target: j,
                        reference_type,
                        strength: ReferenceStrength::from_confidence(confidence),
                        confidence,
                        bidirectional: !matches!(
                            reference_type,
                            ReferenceType::ErrorFix | ReferenceType::ToolSequence
                        ),
                        factors,
                    },
                );
            }
        }
        None
    }

    fn has_evidence(&self, f: &ReferenceFactors) -> bool {
        f.file_similarity >= 0.5
            || f.content_similarity >= self.config.min_content_evidence
            || f.tool_sequence > 0.0
            || f.error_continuation > 0.0
    }

    fn pair_factors(&self, a: &Features, b: &Features) -> ReferenceFactors {
        let file_similarity = a
            .files
            .iter()
            .flat_map(|x| b.files.iter().map(move |y| file_similarity(x, y)))
            .fold(0.0, f64::max);

        let content_similarity =
            signals::jaccard(&a.keywords, &b.keywords).max(signals::jaccard(&a.constructs, &b.constructs));

        let distance = a.turn.abs_diff(b.turn) as f64;
        let window = self.config.temporal_window.max(1) as f64;
        let temporal_proximity = 10f64.powf(-distance / window).max(0.1);

        let shares_file = a.shares_file(b);
        let tool_sequence = match (a.action, b.action) {
            (Some(x), Some(y)) => {
                let unrelated_files = !a.files.is_empty() && !b.files.is_empty() && !shares_file;
                if unrelated_files {
                    0.0
                } else if let Some(score) = signals::tool_pattern(x, y) {
                    score
                } else if shares_file {
                    0.6
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let error_continuation = if a.error && b.fix {
            let shared_keywords = a.keywords.intersection(&b.keywords).count();
            if shares_file || shared_keywords >= 2 { 1.0 } else { 0.0 }
        } else if a.error && b.error && shares_file {
            0.5
        } else {
            0.0
        };

        ReferenceFactors {
            file_similarity,
            content_similarity,
            temporal_proximity,
            tool_sequence,
            error_continuation,
        }
    }

    fn structural(&self, items: &[ContextItem], edges: &mut BTreeMap<(usize, usize), Reference>) {
        let mut link = |a: usize, b: usize, kind: ReferenceType, strength: ReferenceStrength| {
            let key = (a.min(b), a.max(b));
            let entry = edges.entry(key).or_insert_with(|| Reference {
                source: key.0,
                target: key.1,
                reference_type: kind,
                strength,
                confidence: 1.0,
                bidirectional: kind != ReferenceType::ToolSequence,
                factors: ReferenceFactors::default(),
            });
            entry.reference_type = kind;
            entry.confidence = 1.0;
            entry.strength = entry.strength.min(strength);
        };

        // Consecutive members of each tool chain
        let mut last_in_chain: BTreeMap<&str, usize> = BTreeMap::new();
        // Consecutive items of each segment
        let mut last_in_segment: BTreeMap<usize, usize> = BTreeMap::new();

        for (index, item) in items.iter().enumerate() {
            if let Some(segment) = item.metadata.segment {
                if let Some(prev) = last_in_segment.insert(segment, index) {
                    link(prev, index, ReferenceType::ConversationFlow, ReferenceStrength::Moderate);
                }
            }
            if let ItemKind::CodeSnippet { parent, .. } = &item.kind
                && let Some(p) = items[..index].iter().rposition(|i| &i.id == parent)
            {
                link(p, index, ReferenceType::ConversationFlow, ReferenceStrength::Strong);
            }
            if let Some(chain) = item.metadata.chain_id.as_deref() {
                let strength = if item.in_active_chain() {
                    ReferenceStrength::Critical
                } else {
                    ReferenceStrength::Strong
                };
                if let Some(prev) = last_in_chain.insert(chain, index) {
                    link(prev, index, ReferenceType::ToolSequence, strength);
                }
            }
        }
    }
}

/// Reference type from the dominant evidence.
fn dominant_type(f: &ReferenceFactors, a: &Features, b: &Features) -> ReferenceType {
    if f.error_continuation > 0.0 {
        ReferenceType::ErrorFix
    } else if f.tool_sequence > 0.0 {
        ReferenceType::ToolSequence
    } else if f.file_similarity >= 0.5 {
        ReferenceType::FileRef
    } else if a.functions.intersection(&b.functions).next().is_some() {
        ReferenceType::FunctionRef
    } else if a.constructs.intersection(&b.constructs).next().is_some() {
        ReferenceType::VariableRef
    } else {
        ReferenceType::ConceptContinuation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use contextloom_core::item::{ChainState, ItemId, ItemMetadata};
    use contextloom_core::message::Role;

    fn item(index: usize, turn: u64, text: &str) -> ContextItem {
        ContextItem {
            id: ItemId::message(turn, index),
            kind: ItemKind::Turn {
                role: Role::Assistant,
                injection: false,
                tool_calls: vec![],
            },
            text: text.into(),
            token_count: 10,
            turn_index: turn,
            sequence: index,
            timestamp: Utc::now(),
            priority_score: 0.3,
            priority_tier: PriorityTier::Low,
            metadata: ItemMetadata {
                file_paths: signals::file_paths(text),
                function_names: signals::function_names(text),
                ..Default::default()
            },
        }
    }

    fn correlator() -> DependencyCorrelator {
        DependencyCorrelator::new(CorrelationConfig::default())
    }

    #[test]
    fn file_similarity_levels() {
        assert_eq!(file_similarity("src/auth.py", "src/auth.py"), 1.0);
        assert_eq!(file_similarity("src/auth.py", "src/db.py"), 0.6);
        assert_eq!(file_similarity("src/auth.py", "tests/auth.py"), 0.5);
        assert_eq!(file_similarity("src/auth.py", "lib/x.pyi"), 0.2);
        assert_eq!(file_similarity("auth.py", "db.rs"), 0.0);
    }

    #[test]
    fn temporal_proximity_bounds() {
        let c = correlator();
        let same = c.factors(&item(0, 3, "alpha"), &item(1, 3, "beta"));
        assert_eq!(same.temporal_proximity, 1.0);
        let far = c.factors(&item(0, 1, "alpha"), &item(1, 25, "beta"));
        assert_eq!(far.temporal_proximity, 0.1);
        let twenty = c.factors(&item(0, 1, "alpha"), &item(1, 21, "beta"));
        assert!((twenty.temporal_proximity - 0.1).abs() < 1e-12);
    }

    #[test]
    fn distant_mentions_of_same_file_join_one_cluster() {
        let items = vec![
            item(0, 3, "The bug is somewhere in auth.py"),
            item(1, 5, "Weather chatter unrelated"),
            item(2, 9, "Refactored auth.py to use sessions"),
        ];
        let result = correlator().correlate(&items);

        let edge = result
            .references
            .iter()
            .find(|r| r.source == 0 && r.target == 2)
            .expect("auth.py edge");
        assert_eq!(edge.factors.file_similarity, 1.0);
        assert_eq!(edge.reference_type, ReferenceType::FileRef);

        let cluster = result
            .clusters
            .iter()
            .find(|c| c.members.contains(&0))
            .unwrap();
        assert_eq!(cluster.members, vec![0, 2]);
        assert_eq!(result.clusters.len(), 2);
    }

    #[test]
    fn temporal_proximity_alone_does_not_link() {
        let items = vec![item(0, 1, "good morning"), item(1, 1, "lunch plans")];
        let result = correlator().correlate(&items);
        assert!(result.references.is_empty());
        assert_eq!(result.clusters.len(), 2);
    }

    #[test]
    fn error_then_fix_is_error_fix_reference() {
        let mut err = item(0, 2, "Test failed: KeyError in session.py");
        err.metadata.error = true;
        let fix = item(1, 4, "Fixed the KeyError in session.py");
        let result = correlator().correlate(&[err, fix]);
        let r = &result.references[0];
        assert_eq!(r.reference_type, ReferenceType::ErrorFix);
        assert_eq!(r.factors.error_continuation, 1.0);
        assert!(!r.bidirectional);
    }

    #[test]
    fn read_then_edit_is_tool_sequence() {
        let mut read = item(0, 1, "reading config");
        read.metadata.tool_names = vec!["read_file".into()];
        read.metadata.file_paths = vec!["app/main.rs".into()];
        let mut edit = item(1, 2, "editing now");
        edit.metadata.tool_names = vec!["edit_file".into()];
        edit.metadata.file_paths = vec!["app/main.rs".into()];
        let factors = correlator().factors(&read, &edit);
        assert_eq!(factors.tool_sequence, 1.0);
    }

    #[test]
    fn structural_edges_for_chains_and_snippets() {
        let mut call = item(0, 1, "calling");
        let mut result = item(1, 1, "output");
        for i in [&mut call, &mut result] {
            i.metadata.chain_id = Some("chain-a".into());
            i.metadata.chain_state = Some(ChainState::Active);
        }
        let parent = item(2, 2, "see [snippet t2-m2-s0]");
        let mut snippet = item(3, 2, "x = 1");
        snippet.kind = ItemKind::CodeSnippet {
            language: None,
            parent: parent.id.clone(),
        };

        let result = correlator().correlate(&[call, result, parent, snippet]);
        let chain_edge = result
            .references
            .iter()
            .find(|r| r.source == 0 && r.target == 1)
            .unwrap();
        assert_eq!(chain_edge.reference_type, ReferenceType::ToolSequence);
        assert_eq!(chain_edge.strength, ReferenceStrength::Critical);
        assert!(result.clusters[0].has_active_chain);
        assert_eq!(result.clusters[0].tier, PriorityTier::Critical);
        assert_eq!(result.clusters[0].max_strength, Some(ReferenceStrength::Critical));

        let snippet_edge = result
            .references
            .iter()
            .find(|r| r.source == 2 && r.target == 3)
            .unwrap();
        assert_eq!(snippet_edge.strength, ReferenceStrength::Strong);
        assert_eq!(result.clusters.len(), 2);
    }

    #[test]
    fn segment_neighbours_are_linked() {
        let mut a = item(0, 1, "first");
        let mut b = item(1, 1, "second");
        let mut c = item(2, 2, "third");
        a.metadata.segment = Some(0);
        b.metadata.segment = Some(0);
        c.metadata.segment = Some(1);
        let result = correlator().correlate(&[a, b, c]);
        assert_eq!(result.clusters.len(), 2);
        assert_eq!(result.clusters[0].members, vec![0, 1]);
        assert_eq!(result.clusters[0].max_strength, Some(ReferenceStrength::Moderate));
    }

    #[test]
    fn cluster_aggregates_max_priority_and_tokens() {
        let mut items = vec![item(0, 1, "auth.py one"), item(1, 2, "auth.py two")];
        items[1].priority_score = 0.85;
        items[1].priority_tier = PriorityTier::Critical;
        let result = correlator().correlate(&items);
        let cluster = &result.clusters[0];
        assert_eq!(cluster.aggregate_priority, 0.85);
        assert_eq!(cluster.tier, PriorityTier::Critical);
        assert_eq!(cluster.token_count, 20);
        assert_eq!(cluster.earliest_turn, 1);
    }

    #[test]
    fn too_many_items_falls_back_to_structural_edges() {
        let config = CorrelationConfig {
            max_items: 2,
            ..Default::default()
        };
        let correlator = DependencyCorrelator::new(config);
        let items = vec![
            item(0, 1, "auth.py"),
            item(1, 2, "auth.py"),
            item(2, 3, "auth.py"),
        ];
        let result = correlator.correlate(&items);
        assert!(matches!(
            result.timeout,
            Some(ContextError::CorrelationTimeout { items: 3, .. })
        ));
        assert!(result.references.is_empty());
        assert_eq!(result.decisions.len(), 3);
        assert!(result.decisions.iter().all(|d| {
            d.stage == DecisionStage::Correlator
                && d.decision == Decision::Demoted
                && d.reason == "correlation_timeout"
        }));
        assert_eq!(result.clusters.len(), 3);
    }

    #[test]
    fn components_are_iterative_and_ordered() {
        let refs: Vec<Reference> = (0..9_999)
            .map(|i| Reference {
                source: i,
                target: i + 1,
                reference_type: ReferenceType::ConversationFlow,
                strength: ReferenceStrength::Moderate,
                confidence: 1.0,
                bidirectional: false,
                factors: ReferenceFactors::default(),
            })
            .collect();
        let graph = ReferenceGraph::new(10_002, &refs);
        let components = graph.components();
        assert_eq!(components.len(), 3);
        assert_eq!(components[0].len(), 10_000);
        assert_eq!(components[1], vec![10_000]);
        assert_eq!(graph.neighbors(10_001).len(), 0);
    }
}
