//! Decision records: the telemetry side channel of each pipeline stage.
//!
//! Every stage returns its records alongside its primary result; nothing
//! in the pipeline logs decisions through a global. A [`TelemetrySink`] is
//! handed the merged list at the end of the cycle, if one is attached.

use serde::{Deserialize, Serialize};

use crate::item::{ItemId, PriorityTier};

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Included,
    Excluded,
    /// Excluded, but represented by a bridge.
    Bridged,
    /// Excluded with nothing but a structured omission record.
    Omitted,
    /// Tier raised (active chains) or budget overridden.
    Promoted,
    /// Score lowered (orphans, malformed structure).
    Demoted,
}

/// Which pipeline stage made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Analyzer,
    Prioritizer,
    Correlator,
    Assembler,
    BridgeBuilder,
    Optimizer,
}

/// One structured decision about one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub item_id: ItemId,
    pub decision: Decision,
    pub reason: String,
    /// Tokens added to (+) or removed from (−) the context by this decision.
    pub token_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<PriorityTier>,
    pub stage: DecisionStage,
}

impl DecisionRecord {
    pub fn new(
        stage: DecisionStage,
        item_id: ItemId,
        decision: Decision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            decision,
            reason: reason.into(),
            token_delta: 0,
            tier: None,
            stage,
        }
    }

    pub fn with_tokens(mut self, delta: i64) -> Self {
        self.token_delta = delta;
        self
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Receiver of decision records.
///
/// Implementations must not block: emission happens on the assembly
/// path and a slow or missing sink must never change the result.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, records: &[DecisionRecord]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let record = DecisionRecord::new(
            DecisionStage::Assembler,
            ItemId::message(2, 0),
            Decision::Included,
            "fits tier budget",
        )
        .with_tokens(42)
        .with_tier(PriorityTier::High);
        assert_eq!(record.token_delta, 42);
        assert_eq!(record.tier, Some(PriorityTier::High));
    }

    #[test]
    fn serializes_snake_case() {
        let record = DecisionRecord::new(
            DecisionStage::BridgeBuilder,
            ItemId::bridge(1),
            Decision::Bridged,
            "tool chain summary",
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["decision"], "bridged");
        assert_eq!(json["stage"], "bridge_builder");
        assert!(json.get("tier").is_none());
    }
}
