//! Conversation store trait: the append-only turn log the engine reads.
//!
//! The store owns persistence and eviction. The engine only ever takes an
//! immutable [`ConversationSnapshot`] at the start of a cycle; writes that
//! land afterwards are invisible to that cycle.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::SessionId;
use crate::turn::ConversationTurn;

/// An immutable view of a session's turns, cheap to clone and share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub session_id: SessionId,
    pub turns: Arc<[ConversationTurn]>,
}

impl ConversationSnapshot {
    pub fn new(session_id: SessionId, turns: Vec<ConversationTurn>) -> Self {
        Self {
            session_id,
            turns: turns.into(),
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of the newest turn, or 0 for an empty session.
    pub fn latest_turn_number(&self) -> u64 {
        self.turns.last().map(|t| t.turn_number).unwrap_or(0)
    }
}

/// The conversation store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// A human-readable name for this store (e.g., "in_memory", "json_file").
    fn name(&self) -> &str;

    /// Append a completed turn. Single writer per turn.
    async fn append(&self, session: &SessionId, turn: ConversationTurn) -> Result<(), StoreError>;

    /// Take an immutable snapshot of the session's turns.
    async fn snapshot(&self, session: &SessionId) -> Result<ConversationSnapshot, StoreError>;

    /// Hint for the maximum number of stored turns; the store evicts the
    /// oldest turns once it is exceeded.
    fn set_max_stored_turns(&self, max: usize);

    /// Ask the store to evict down to the `keep_last` newest turns.
    /// Returns the number of turns evicted.
    async fn request_eviction(&self, session: &SessionId, keep_last: usize)
    -> Result<usize, StoreError>;
}
