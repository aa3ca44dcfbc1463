//! Typed references between context items.

use serde::{Deserialize, Serialize};

/// What links two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    FileRef,
    FunctionRef,
    VariableRef,
    ErrorFix,
    ToolSequence,
    ConversationFlow,
    ConceptContinuation,
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FileRef => "file_ref",
            Self::FunctionRef => "function_ref",
            Self::VariableRef => "variable_ref",
            Self::ErrorFix => "error_fix",
            Self::ToolSequence => "tool_sequence",
            Self::ConversationFlow => "conversation_flow",
            Self::ConceptContinuation => "concept_continuation",
        };
        write!(f, "{name}")
    }
}

/// How much the pair depends on each other, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStrength {
    Critical,
    Strong,
    Moderate,
    Weak,
}

impl ReferenceStrength {
    /// Bucket a confidence value.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.7 {
            Self::Critical
        } else if confidence >= 0.5 {
            Self::Strong
        } else if confidence >= 0.3 {
            Self::Moderate
        } else {
            Self::Weak
        }
    }

    /// Whether `self` is at least as strong as `other`.
    pub fn at_least(self, other: ReferenceStrength) -> bool {
        self <= other
    }
}

/// The five weighted sub-scores behind a reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFactors {
    pub file_similarity: f64,
    pub content_similarity: f64,
    pub temporal_proximity: f64,
    pub tool_sequence: f64,
    pub error_continuation: f64,
}

/// A typed edge between two items, addressed by their index in the
/// cycle's item arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub source: usize,
    pub target: usize,
    pub reference_type: ReferenceType,
    pub strength: ReferenceStrength,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub bidirectional: bool,
    #[serde(default)]
    pub factors: ReferenceFactors,
}

impl Reference {
    /// Whether this edge touches `index`.
    pub fn touches(&self, index: usize) -> bool {
        self.source == index || self.target == index
    }

    /// The endpoint opposite `index`.
    pub fn other(&self, index: usize) -> usize {
        if self.source == index {
            self.target
        } else {
            self.source
        }
    }
}

/// The shape of a bridge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeType {
    ToolChainSummary,
    ErrorContextLink,
    ReferenceContinuity,
    ConversationFlow,
    GenericSummary,
}

impl std::fmt::Display for BridgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ToolChainSummary => "tool chain",
            Self::ErrorContextLink => "error context",
            Self::ReferenceContinuity => "references",
            Self::ConversationFlow => "conversation",
            Self::GenericSummary => "summary",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_buckets() {
        assert_eq!(ReferenceStrength::from_confidence(1.0), ReferenceStrength::Critical);
        assert_eq!(ReferenceStrength::from_confidence(0.55), ReferenceStrength::Strong);
        assert_eq!(ReferenceStrength::from_confidence(0.3), ReferenceStrength::Moderate);
        assert_eq!(ReferenceStrength::from_confidence(0.11), ReferenceStrength::Weak);
    }

    #[test]
    fn strength_ordering() {
        assert!(ReferenceStrength::Critical.at_least(ReferenceStrength::Strong));
        assert!(ReferenceStrength::Strong.at_least(ReferenceStrength::Strong));
        assert!(!ReferenceStrength::Weak.at_least(ReferenceStrength::Moderate));
    }

    #[test]
    fn other_endpoint() {
        let r = Reference {
            source: 2,
            target: 5,
            reference_type: ReferenceType::FileRef,
            strength: ReferenceStrength::Strong,
            confidence: 0.6,
            bidirectional: true,
            factors: ReferenceFactors::default(),
        };
        assert!(r.touches(5));
        assert_eq!(r.other(2), 5);
        assert_eq!(r.other(5), 2);
    }
}
