//! Conversation turns: the unit the conversation store appends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};
use crate::tool::ToolExecutionRecord;

/// One turn of the conversation: typically a user message, the agent's
/// reply, and any tool calls and results in between.
///
/// `turn_number` increases monotonically within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_number: u64,

    /// Ordered messages of this turn
    pub messages: Vec<Message>,

    /// Execution records for tool calls made during this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_records: Vec<ToolExecutionRecord>,

    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(turn_number: u64) -> Self {
        Self {
            turn_number,
            messages: Vec::new(),
            tool_records: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style message append.
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Builder-style tool record append.
    pub fn with_record(mut self, record: ToolExecutionRecord) -> Self {
        self.tool_records.push(record);
        self
    }

    /// The first user message of this turn, if any.
    pub fn user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User && !m.is_context_injection())
    }

    /// Look up the execution record for a tool call.
    pub fn record_for(&self, call_id: &str) -> Option<&ToolExecutionRecord> {
        self.tool_records.iter().find(|r| r.call_id == call_id)
    }

    /// Total characters across all messages, a cheap size hint.
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}
