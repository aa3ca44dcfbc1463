//! Context items: the candidate units the engine selects from.
//!
//! Items are derived fresh from a conversation snapshot every assembly
//! cycle and are never persisted. Scoring and bridging branch on
//! [`ItemKind`], but every kind shares the same priority and metadata shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Role;
use crate::reference::BridgeType;

/// Deterministic identifier of an item within one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    /// `t{turn}-m{index}` for a message.
    pub fn message(turn: u64, index: usize) -> Self {
        Self(format!("t{turn}-m{index}"))
    }

    /// `t{turn}-m{index}-s{k}` for the k-th code snippet of a message.
    pub fn snippet(turn: u64, index: usize, k: usize) -> Self {
        Self(format!("t{turn}-m{index}-s{k}"))
    }

    /// `bridge-c{cluster}` for a bridge standing in for a cluster.
    pub fn bridge(cluster: usize) -> Self {
        Self(format!("bridge-c{cluster}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an item is, with the payload specific to that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    /// A conversational message (user, agent, or injected context).
    Turn {
        role: Role,
        #[serde(default)]
        injection: bool,
        /// Tool calls issued by this message, kept for payload rendering.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<crate::message::MessageToolCall>,
    },
    /// A fenced code block split out of a message.
    CodeSnippet {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        parent: ItemId,
    },
    /// The result of a tool call.
    ToolResult { tool_name: String, call_id: String },
    /// A synthesized stand-in for excluded content.
    Bridge {
        bridge_type: BridgeType,
        covers: Vec<ItemId>,
    },
}

impl ItemKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Turn { .. } => "turn",
            Self::CodeSnippet { .. } => "code_snippet",
            Self::ToolResult { .. } => "tool_result",
            Self::Bridge { .. } => "bridge",
        }
    }

    pub fn is_snippet(&self) -> bool {
        matches!(self, Self::CodeSnippet { .. })
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self, Self::Bridge { .. })
    }
}

/// Completion state of a tool chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    /// Awaiting a result or the agent response that consumes it.
    Active,
    Completed,
}

/// Priority tier, governing assembly order and budget allocation.
///
/// Ordered so that `Critical < High < ... < Minimal`; sorting ascending
/// yields the assembly order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Critical,
    High,
    Medium,
    Low,
    Minimal,
}

impl PriorityTier {
    /// All tiers in assembly order.
    pub const ALL: [PriorityTier; 5] = [
        PriorityTier::Critical,
        PriorityTier::High,
        PriorityTier::Medium,
        PriorityTier::Low,
        PriorityTier::Minimal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Minimal => "minimal",
        };
        write!(f, "{name}")
    }
}

/// Opaque per-item metadata extracted during analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_names: Vec<String>,

    /// Tools called by, or answered in, this item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_names: Vec<String>,

    /// Error marker present (text markers or the tool's error flag)
    #[serde(default)]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_state: Option<ChainState>,

    /// Tool result whose call could not be found
    #[serde(default)]
    pub orphan: bool,

    /// Index of the conversational segment this item belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<usize>,
}

/// A unit of candidate content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub text: String,
    pub token_count: usize,
    pub turn_index: u64,
    /// Global position in the flattened log, used for stable ordering.
    pub sequence: usize,
    pub timestamp: DateTime<Utc>,
    /// Composite relevance score in `[0, 1]`.
    pub priority_score: f64,
    pub priority_tier: PriorityTier,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl ContextItem {
    /// Whether this item belongs to a tool chain that is still in flight.
    pub fn in_active_chain(&self) -> bool {
        self.metadata.chain_state == Some(ChainState::Active)
    }
}
