//! In-memory store: useful for testing and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use contextloom_core::error::StoreError;
use contextloom_core::message::SessionId;
use contextloom_core::store::{ConversationSnapshot, ConversationStore};
use contextloom_core::turn::ConversationTurn;
use tokio::sync::RwLock;
use tracing::debug;

use crate::appended;

pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<SessionId, Arc<[ConversationTurn]>>>,
    max_stored_turns: AtomicUsize,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_stored_turns: AtomicUsize::new(usize::MAX),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, session: &SessionId, turn: ConversationTurn) -> Result<(), StoreError> {
        let max = self.max_stored_turns.load(Ordering::Relaxed);
        let mut sessions = self.sessions.write().await;
        let existing = sessions.get(session).map(|t| &t[..]).unwrap_or(&[]);
        let turns = appended(existing, turn, max)?;
        sessions.insert(session.clone(), turns.into());
        Ok(())
    }

    async fn snapshot(&self, session: &SessionId) -> Result<ConversationSnapshot, StoreError> {
        let sessions = self.sessions.read().await;
        let turns = sessions
            .get(session)
            .ok_or_else(|| StoreError::SessionNotFound(session.to_string()))?;
        Ok(ConversationSnapshot {
            session_id: session.clone(),
            turns: Arc::clone(turns),
        })
    }

    fn set_max_stored_turns(&self, max: usize) {
        self.max_stored_turns.store(max.max(1), Ordering::Relaxed);
    }

    async fn request_eviction(
        &self,
        session: &SessionId,
        keep_last: usize,
    ) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        let turns = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::SessionNotFound(session.to_string()))?;
        let evicted = turns.len().saturating_sub(keep_last);
        if evicted > 0 {
            *turns = turns[evicted..].into();
            debug!(session = %session, evicted, "Evicted old turns");
        }
        Ok(evicted)
    }
}
