//! Context assembler: fills the history budget tier by tier.
//!
//! Order of work for one cycle:
//!
//! 1. **Emergency**: a budget below the floor yields no history at all.
//! 2. **Retention**: under pressure the conservative strategy narrows the
//!    candidates to active chains and the latest completed segments.
//! 3. **Active chains**: always included in full (or the cycle fails,
//!    depending on [`ActiveChainPolicy`]).
//! 4. **Whole clusters**: CRITICAL → MINIMAL, each tier holding back the
//!    reservations of lower tiers that still have candidates.
//! 5. **Deferred clusters**: partial admission in priority order with
//!    tool chains kept atomic, leaving room for the bridge; the remainder
//!    is bridged or recorded as an omission.
//!
//! # Determinism
//!
//! Every ordering is explicit (tier, score, turn, id, sequence). Identical
//! inputs always produce identical selections.

use std::collections::BTreeSet;

use contextloom_config::{ActiveChainPolicy, AssemblyConfig, BridgeConfig, ContextStrategy};
use contextloom_core::decision::{Decision, DecisionRecord, DecisionStage};
use contextloom_core::error::ContextError;
use contextloom_core::item::{ContextItem, ItemId, PriorityTier};
use contextloom_core::reference::{Reference, ReferenceStrength, ReferenceType};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::analyzer::Segment;
use super::bridge::{BridgeBuilder, ExcludedCluster};
use super::budget::Budget;
use super::correlator::DependencyCluster;
use super::token::TokenAccountant;

// ── Types ─────────────────────────────────────────────────────────────────

/// Everything the assembler reads for one cycle.
pub struct AssemblyInput<'a> {
    /// Scored candidate items; references and clusters index into this.
    pub items: &'a [ContextItem],
    pub references: &'a [Reference],
    pub clusters: &'a [DependencyCluster],
    pub segments: &'a [Segment],
    pub budget: Budget,
    pub tokens: &'a TokenAccountant,
}

/// The selected history, ready to be merged into a request.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledContext {
    /// Included items and bridges, in conversation order.
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    pub budget: Budget,
    /// Per-tier breakdown, CRITICAL first.
    pub tiers: Vec<TierStats>,
    pub bridge_tokens: usize,
    pub omissions: Vec<OmissionRecord>,
    /// An active chain was kept although it exceeds the budget.
    pub budget_override: bool,
    /// Only mandatory elements; no history fits.
    pub emergency: bool,
    pub strategy: ContextStrategy,
}

impl AssembledContext {
    /// Fraction of the available budget in use.
    pub fn utilization(&self) -> f64 {
        if self.budget.available == 0 {
            return if self.total_tokens == 0 { 0.0 } else { f64::INFINITY };
        }
        self.total_tokens as f64 / self.budget.available as f64
    }

    /// Over budget beyond tolerance, without an explicit override.
    pub fn overflows(&self) -> bool {
        !self.budget_override && !self.budget.fits(self.total_tokens)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.iter().any(|i| &i.id == id)
    }

    pub fn bridges(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(|i| i.kind.is_bridge())
    }
}

/// Token usage of one priority tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: PriorityTier,
    /// Floor held for this tier while higher tiers fill
    pub reserved: usize,
    pub tokens: usize,
    pub clusters_included: usize,
    pub clusters_total: usize,
    pub items_included: usize,
}

/// Excluded content that no bridge represents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OmissionRecord {
    pub cluster: usize,
    pub item_ids: Vec<ItemId>,
    pub tokens: usize,
    pub reason: String,
}

// ── Assembler ─────────────────────────────────────────────────────────────

pub struct ContextAssembler {
    config: AssemblyConfig,
    bridges: BridgeBuilder,
    recent_segments: usize,
    pressure_threshold: f64,
}

impl ContextAssembler {
    pub fn new(config: AssemblyConfig, bridge: BridgeConfig, pressure_threshold: f64) -> Self {
        let recent_segments = bridge.conservative_recent_segments;
        Self {
            config,
            bridges: BridgeBuilder::new(bridge),
            recent_segments,
            pressure_threshold,
        }
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.bridges.strategy()
    }

    /// Select items for `input.budget`.
    ///
    /// Fails only with `ChainExceedsBudget` under [`ActiveChainPolicy::Fail`].
    pub fn assemble(
        &self,
        input: &AssemblyInput<'_>,
    ) -> Result<(AssembledContext, Vec<DecisionRecord>), ContextError> {
        let mut fill = Fill::new(input.items.len());

        if input.budget.emergency {
            warn!(
                available = input.budget.available,
                "Emergency budget, assembling mandatory elements only"
            );
            for cluster in input.clusters {
                fill.omit(input.items, cluster, &cluster.members, "emergency_budget", "emergency_budget");
            }
            return Ok(self.finish(input, fill, true));
        }

        let eligible = self.retention(input);
        self.force_active_chains(input, &mut fill)?;

        let order = cluster_order(input.clusters);
        self.admit_whole(input, &order, &eligible, &mut fill);
        self.admit_deferred(input, &order, &eligible, &mut fill);

        Ok(self.finish(input, fill, false))
    }

    /// Which items may be admitted at all.
    fn retention(&self, input: &AssemblyInput<'_>) -> Vec<bool> {
        let items = input.items;
        let everything = vec![true; items.len()];
        if self.bridges.strategy() != ContextStrategy::Conservative {
            return everything;
        }
        let demand: usize = items.iter().map(|i| i.token_count).sum();
        if (demand as f64) <= self.pressure_threshold * input.budget.available as f64 {
            return everything;
        }

        let keep: Vec<usize> = input
            .segments
            .iter()
            .filter(|s| s.completed)
            .map(|s| s.index)
            .rev()
            .take(self.recent_segments)
            .collect();
        info!(
            demand,
            available = input.budget.available,
            kept_segments = ?keep,
            "Under pressure, retaining active chains and recent segments"
        );
        items
            .iter()
            .map(|i| i.in_active_chain() || i.metadata.segment.is_some_and(|s| keep.contains(&s)))
            .collect()
    }

    fn force_active_chains(
        &self,
        input: &AssemblyInput<'_>,
        fill: &mut Fill,
    ) -> Result<(), ContextError> {
        let items = input.items;
        let mut chains: Vec<(&str, Vec<usize>)> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if !item.in_active_chain() {
                continue;
            }
            let chain_id = item.metadata.chain_id.as_deref().unwrap_or_default();
            match chains.iter_mut().find(|(id, _)| *id == chain_id) {
                Some((_, members)) => members.push(index),
                None => chains.push((chain_id, vec![index])),
            }
        }

        let ceiling = input.budget.ceiling();
        for (chain_id, members) in chains {
            let chain_tokens: usize = members.iter().map(|m| items[*m].token_count).sum();
            let over = fill.used + chain_tokens > ceiling;
            if over {
                match self.config.active_chain_policy {
                    ActiveChainPolicy::Fail => {
                        return Err(ContextError::ChainExceedsBudget {
                            chain_id: chain_id.to_string(),
                            chain_tokens,
                            available: input.budget.available,
                        });
                    }
                    ActiveChainPolicy::Override => {
                        warn!(
                            chain = chain_id,
                            chain_tokens,
                            available = input.budget.available,
                            "Active chain exceeds budget, including it anyway"
                        );
                        fill.budget_override = true;
                    }
                }
            }
            for m in members {
                fill.include(items, m, PriorityTier::Critical, "active_chain");
                if over {
                    fill.decisions.push(
                        DecisionRecord::new(
                            DecisionStage::Assembler,
                            items[m].id.clone(),
                            Decision::Promoted,
                            "active_chain_override",
                        )
                        .with_tier(PriorityTier::Critical),
                    );
                }
            }
        }
        Ok(())
    }

    /// First pass: whole clusters, tier by tier.
    fn admit_whole(
        &self,
        input: &AssemblyInput<'_>,
        order: &[usize],
        eligible: &[bool],
        fill: &mut Fill,
    ) {
        let items = input.items;
        let available = input.budget.available;
        let reservations = &self.config.tier_reservations;

        let candidates: Vec<Vec<usize>> = input
            .clusters
            .iter()
            .map(|c| {
                c.members
                    .iter()
                    .copied()
                    .filter(|m| eligible[*m] && !fill.included[*m])
                    .collect()
            })
            .collect();
        let cost = |members: &[usize]| members.iter().map(|m| items[*m].token_count).sum::<usize>();

        let mut pending = [0usize; 5];
        for &c in order {
            pending[input.clusters[c].tier.index()] += cost(&candidates[c]);
        }

        for &c in order {
            let cluster = &input.clusters[c];
            let tier = cluster.tier;
            let members = &candidates[c];
            let tokens = cost(members);
            pending[tier.index()] -= tokens;
            if members.is_empty() {
                continue;
            }

            let held: usize = PriorityTier::ALL
                .iter()
                .filter(|lower| **lower > tier)
                .map(|lower| {
                    let floor = (reservations.for_tier(*lower) * available as f64).floor() as usize;
                    floor.min(pending[lower.index()])
                })
                .sum();
            let cap = available.saturating_sub(held);

            if fill.used + tokens <= cap {
                for m in members {
                    fill.include(items, *m, tier, "fits_tier_budget");
                }
            } else {
                debug!(cluster = c, tokens, cap, used = fill.used, "Cluster deferred");
            }
        }
    }

    /// Second pass: partial admission, then bridge or omit the remainder.
    fn admit_deferred(
        &self,
        input: &AssemblyInput<'_>,
        order: &[usize],
        eligible: &[bool],
        fill: &mut Fill,
    ) {
        let items = input.items;
        let available = input.budget.available;

        for &c in order {
            let cluster = &input.clusters[c];
            let outstanding: Vec<usize> = cluster
                .members
                .iter()
                .copied()
                .filter(|m| !fill.included[*m])
                .collect();
            if outstanding.is_empty() {
                continue;
            }
            let candidates: Vec<usize> = outstanding.iter().copied().filter(|m| eligible[*m]).collect();
            let outstanding_tokens: usize = outstanding.iter().map(|m| items[*m].token_count).sum();
            let candidate_tokens: usize = candidates.iter().map(|m| items[*m].token_count).sum();

            if !candidates.is_empty() {
                if candidates.len() == outstanding.len() && fill.used + candidate_tokens <= available {
                    for m in &candidates {
                        fill.include(items, *m, cluster.tier, "fits_remaining_budget");
                    }
                } else if self.config.allow_partial_clusters {
                    let reserve = self.bridges.reserve_for(outstanding_tokens);
                    for unit in atomic_units(items, &candidates) {
                        let tokens: usize = unit.iter().map(|m| items[*m].token_count).sum();
                        if fill.used + tokens + reserve <= available {
                            for m in unit {
                                fill.include(items, m, cluster.tier, "partial_cluster");
                            }
                        }
                    }
                }
            }

            let excluded: Vec<usize> = outstanding
                .into_iter()
                .filter(|m| !fill.included[*m])
                .collect();
            if excluded.is_empty() {
                continue;
            }
            let reason = if excluded.iter().any(|m| !eligible[*m]) {
                "outside_retention_window"
            } else {
                "over_budget"
            };
            self.bridge_or_omit(input, cluster, &excluded, reason, fill);
        }
    }

    fn bridge_or_omit(
        &self,
        input: &AssemblyInput<'_>,
        cluster: &DependencyCluster,
        excluded: &[usize],
        reason: &str,
        fill: &mut Fill,
    ) {
        let items = input.items;
        let excluded_set: BTreeSet<usize> = excluded.iter().copied().collect();

        let mut crossing_strength: Option<ReferenceStrength> = None;
        let mut has_error_fix = false;
        for r in input.references {
            let (source_out, target_out) = (excluded_set.contains(&r.source), excluded_set.contains(&r.target));
            if source_out && target_out && r.reference_type == ReferenceType::ErrorFix {
                has_error_fix = true;
            }
            if (source_out && fill.included[r.target]) || (target_out && fill.included[r.source]) {
                crossing_strength = Some(crossing_strength.map_or(r.strength, |s| s.min(r.strength)));
            }
        }

        let included_entities: BTreeSet<&str> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| fill.included[*i])
            .flat_map(|(_, item)| entities(item))
            .collect();
        let shared_with_included = excluded
            .iter()
            .flat_map(|m| entities(&items[*m]))
            .any(|e| included_entities.contains(e));

        let view = ExcludedCluster {
            cluster_id: cluster.id,
            items: excluded.iter().map(|m| &items[*m]).collect(),
            tier: cluster.tier,
            max_strength: cluster.max_strength,
            partially_admitted: cluster.members.iter().any(|m| fill.included[*m]),
            crossing_strength,
            has_error_fix,
            shared_with_included,
        };

        let why = if self.bridges.should_bridge(&view) {
            let remaining = input.budget.available.saturating_sub(fill.used);
            match self.bridges.bridge(&view, remaining, input.tokens) {
                Some(bridge) => {
                    debug!(cluster = cluster.id, tokens = bridge.token_count, "Bridge built");
                    for m in excluded {
                        fill.decisions.push(
                            DecisionRecord::new(
                                DecisionStage::BridgeBuilder,
                                items[*m].id.clone(),
                                Decision::Bridged,
                                reason,
                            )
                            .with_tokens(-(items[*m].token_count as i64))
                            .with_tier(cluster.tier),
                        );
                    }
                    fill.decisions.push(
                        DecisionRecord::new(
                            DecisionStage::BridgeBuilder,
                            bridge.id.clone(),
                            Decision::Included,
                            "bridge",
                        )
                        .with_tokens(bridge.token_count as i64)
                        .with_tier(cluster.tier),
                    );
                    fill.used += bridge.token_count;
                    fill.bridges.push(bridge);
                    return;
                }
                None => "no_bridge_room",
            }
        } else {
            "bridge_not_selected"
        };
        fill.omit(items, cluster, excluded, reason, why);
    }

    fn finish(
        &self,
        input: &AssemblyInput<'_>,
        fill: Fill,
        emergency: bool,
    ) -> (AssembledContext, Vec<DecisionRecord>) {
        let items = input.items;
        let available = input.budget.available;

        let mut tiers: Vec<TierStats> = PriorityTier::ALL
            .iter()
            .map(|tier| TierStats {
                tier: *tier,
                reserved: (self.config.tier_reservations.for_tier(*tier) * available as f64).floor() as usize,
                tokens: 0,
                clusters_included: 0,
                clusters_total: 0,
                items_included: 0,
            })
            .collect();
        for cluster in input.clusters {
            let stats = &mut tiers[cluster.tier.index()];
            stats.clusters_total += 1;
            let admitted: Vec<usize> = cluster
                .members
                .iter()
                .copied()
                .filter(|m| fill.included[*m])
                .collect();
            if admitted.len() == cluster.members.len() {
                stats.clusters_included += 1;
            }
            stats.items_included += admitted.len();
            stats.tokens += admitted.iter().map(|m| items[*m].token_count).sum::<usize>();
        }
        for bridge in &fill.bridges {
            tiers[bridge.priority_tier.index()].tokens += bridge.token_count;
        }

        let bridge_tokens: usize = fill.bridges.iter().map(|b| b.token_count).sum();
        let mut selected: Vec<ContextItem> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| fill.included[*i])
            .map(|(_, item)| item.clone())
            .collect();
        selected.extend(fill.bridges);
        selected.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.kind.is_bridge().cmp(&b.kind.is_bridge()))
                .then_with(|| a.id.cmp(&b.id))
        });
        let total_tokens: usize = selected.iter().map(|i| i.token_count).sum();

        info!(
            items = selected.len(),
            total_tokens,
            available,
            bridge_tokens,
            omissions = fill.omissions.len(),
            budget_override = fill.budget_override,
            "Context assembled"
        );

        let context = AssembledContext {
            items: selected,
            total_tokens,
            budget: input.budget,
            tiers,
            bridge_tokens,
            omissions: fill.omissions,
            budget_override: fill.budget_override,
            emergency,
            strategy: self.bridges.strategy(),
        };
        (context, fill.decisions)
    }
}

// ── Fill state ────────────────────────────────────────────────────────────

struct Fill {
    included: Vec<bool>,
    used: usize,
    bridges: Vec<ContextItem>,
    omissions: Vec<OmissionRecord>,
    decisions: Vec<DecisionRecord>,
    budget_override: bool,
}

impl Fill {
    fn new(n: usize) -> Self {
        Self {
            included: vec![false; n],
            used: 0,
            bridges: Vec::new(),
            omissions: Vec::new(),
            decisions: Vec::new(),
            budget_override: false,
        }
    }

    fn include(&mut self, items: &[ContextItem], index: usize, tier: PriorityTier, reason: &str) {
        if self.included[index] {
            return;
        }
        self.included[index] = true;
        self.used += items[index].token_count;
        self.decisions.push(
            DecisionRecord::new(
                DecisionStage::Assembler,
                items[index].id.clone(),
                Decision::Included,
                reason,
            )
            .with_tokens(items[index].token_count as i64)
            .with_tier(tier),
        );
    }

    fn omit(
        &mut self,
        items: &[ContextItem],
        cluster: &DependencyCluster,
        members: &[usize],
        reason: &str,
        record_reason: &str,
    ) {
        if members.is_empty() {
            return;
        }
        for m in members {
            self.decisions.push(
                DecisionRecord::new(
                    DecisionStage::Assembler,
                    items[*m].id.clone(),
                    Decision::Omitted,
                    reason,
                )
                .with_tokens(-(items[*m].token_count as i64))
                .with_tier(cluster.tier),
            );
        }
        self.omissions.push(OmissionRecord {
            cluster: cluster.id,
            item_ids: members.iter().map(|m| items[*m].id.clone()).collect(),
            tokens: members.iter().map(|m| items[*m].token_count).sum(),
            reason: record_reason.to_string(),
        });
    }
}

// ── Ordering ──────────────────────────────────────────────────────────────

/// Aggregate priority descending, then tier, earliest turn, cluster id.
///
/// Orphans keep their halved score but are capped at LOW, so the score
/// and the tier can disagree; the score wins.
fn cluster_order(clusters: &[DependencyCluster]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..clusters.len()).collect();
    order.sort_by(|a, b| {
        let (x, y) = (&clusters[*a], &clusters[*b]);
        y.aggregate_priority
            .total_cmp(&x.aggregate_priority)
            .then_with(|| x.tier.cmp(&y.tier))
            .then_with(|| x.earliest_turn.cmp(&y.earliest_turn))
            .then_with(|| x.id.cmp(&y.id))
    });
    order
}

/// Admission units: a tool chain's members travel together, everything
/// else alone. Ordered by best member score, then earliest sequence.
fn atomic_units(items: &[ContextItem], candidates: &[usize]) -> Vec<Vec<usize>> {
    let mut units: Vec<(Option<&str>, Vec<usize>)> = Vec::new();
    for &m in candidates {
        match items[m].metadata.chain_id.as_deref() {
            Some(chain) => match units.iter_mut().find(|(c, _)| *c == Some(chain)) {
                Some((_, members)) => members.push(m),
                None => units.push((Some(chain), vec![m])),
            },
            None => units.push((None, vec![m])),
        }
    }
    let best = |unit: &[usize]| unit.iter().map(|m| items[*m].priority_score).fold(0.0, f64::max);
    let first = |unit: &[usize]| unit.iter().map(|m| items[*m].sequence).min().unwrap_or(0);

    let mut units: Vec<Vec<usize>> = units.into_iter().map(|(_, members)| members).collect();
    units.sort_by(|a, b| best(b).total_cmp(&best(a)).then_with(|| first(a).cmp(&first(b))));
    units
}

/// File and function names an item mentions.
fn entities(item: &ContextItem) -> impl Iterator<Item = &str> {
    item.metadata
        .file_paths
        .iter()
        .chain(item.metadata.function_names.iter())
        .map(String::as_str)
}
