//! Per-cycle aggregation of decision records.

use std::collections::BTreeMap;

use contextloom_core::decision::{Decision, DecisionRecord};
use serde::Serialize;

/// Counts and token deltas over one cycle's decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub records: usize,
    pub included: usize,
    pub excluded: usize,
    pub bridged: usize,
    pub omitted: usize,
    pub promoted: usize,
    pub demoted: usize,
    /// Sum of positive token deltas
    pub tokens_added: i64,
    /// Sum of negative token deltas, as a positive number
    pub tokens_removed: i64,
    /// Record count per reason, sorted by reason
    pub reasons: BTreeMap<String, usize>,
}

impl CycleSummary {
    pub fn from_records(records: &[DecisionRecord]) -> Self {
        let mut summary = Self {
            records: records.len(),
            ..Default::default()
        };
        for record in records {
            let counter = match record.decision {
                Decision::Included => &mut summary.included,
                Decision::Excluded => &mut summary.excluded,
                Decision::Bridged => &mut summary.bridged,
                Decision::Omitted => &mut summary.omitted,
                Decision::Promoted => &mut summary.promoted,
                Decision::Demoted => &mut summary.demoted,
            };
            *counter += 1;

            if record.token_delta >= 0 {
                summary.tokens_added += record.token_delta;
            } else {
                summary.tokens_removed += -record.token_delta;
            }
            *summary.reasons.entry(record.reason.clone()).or_default() += 1;
        }
        summary
    }

    /// Net token change across the cycle.
    pub fn net_tokens(&self) -> i64 {
        self.tokens_added - self.tokens_removed
    }
}

impl std::fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} decisions: {} included, {} excluded, {} bridged, {} omitted, {} promoted, {} demoted; +{}/-{} tokens",
            self.records,
            self.included,
            self.excluded,
            self.bridged,
            self.omitted,
            self.promoted,
            self.demoted,
            self.tokens_added,
            self.tokens_removed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextloom_core::decision::DecisionStage;
    use contextloom_core::item::ItemId;

    #[test]
    fn counts_and_deltas() {
        let records = vec![
            DecisionRecord::new(DecisionStage::Assembler, ItemId::message(1, 0), Decision::Included, "fits")
                .with_tokens(30),
            DecisionRecord::new(DecisionStage::Assembler, ItemId::message(1, 1), Decision::Included, "fits")
                .with_tokens(20),
            DecisionRecord::new(DecisionStage::Optimizer, ItemId::message(2, 2), Decision::Excluded, "reduction_level_1")
                .with_tokens(-15),
            DecisionRecord::new(DecisionStage::BridgeBuilder, ItemId::message(2, 3), Decision::Bridged, "over_budget"),
        ];
        let summary = CycleSummary::from_records(&records);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.included, 2);
        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.bridged, 1);
        assert_eq!(summary.tokens_added, 50);
        assert_eq!(summary.tokens_removed, 15);
        assert_eq!(summary.net_tokens(), 35);
        assert_eq!(summary.reasons["fits"], 2);
    }

    #[test]
    fn display_is_one_line() {
        let summary = CycleSummary::from_records(&[]);
        let line = summary.to_string();
        assert!(line.starts_with("0 decisions"));
        assert!(!line.contains('\n'));
    }
}
