//! JSON file store: one human-inspectable file per session.
//!
//! Each session lives at `<dir>/<session_id>.json` as
//! `{"session_id": ..., "turns": [...]}`. Sessions are loaded lazily on
//! first access and rewritten on every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use contextloom_core::error::StoreError;
use contextloom_core::message::SessionId;
use contextloom_core::store::{ConversationSnapshot, ConversationStore};
use contextloom_core::turn::ConversationTurn;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::appended;

#[derive(Serialize, Deserialize)]
struct SessionFile {
    session_id: SessionId,
    turns: Vec<ConversationTurn>,
}

pub struct JsonFileStore {
    dir: PathBuf,
    cache: RwLock<HashMap<SessionId, Arc<[ConversationTurn]>>>,
    max_stored_turns: AtomicUsize,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Storage(format!("Failed to create store directory {}: {e}", dir.display()))
        })?;
        debug!(dir = %dir.display(), "JSON file store opened");
        Ok(Self {
            dir,
            cache: RwLock::new(HashMap::new()),
            max_stored_turns: AtomicUsize::new(usize::MAX),
        })
    }

    /// Default directory: `~/.contextloom/sessions`
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".contextloom").join("sessions")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session: &SessionId) -> PathBuf {
        let name: String = session
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    /// Read a session file written by this store (or by hand).
    pub async fn read_file(path: &Path) -> Result<ConversationSnapshot, StoreError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to read {}: {e}", path.display())))?;
        let file: SessionFile = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Storage(format!("Corrupted session file {}: {e}", path.display())))?;
        Ok(ConversationSnapshot::new(file.session_id, file.turns))
    }

    async fn load(&self, session: &SessionId) -> Result<Option<Arc<[ConversationTurn]>>, StoreError> {
        if let Some(turns) = self.cache.read().await.get(session) {
            return Ok(Some(Arc::clone(turns)));
        }
        let path = self.session_path(session);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let snapshot = Self::read_file(&path).await?;
        if snapshot.session_id != *session {
            warn!(
                expected = %session,
                found = %snapshot.session_id,
                "Session file id mismatch, using the requested id"
            );
        }
        let mut cache = self.cache.write().await;
        let turns = cache.entry(session.clone()).or_insert(snapshot.turns);
        Ok(Some(Arc::clone(turns)))
    }

    async fn flush(&self, session: &SessionId, turns: &[ConversationTurn]) -> Result<(), StoreError> {
        let file = SessionFile {
            session_id: session.clone(),
            turns: turns.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize session: {e}")))?;
        let path = self.session_path(session);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to replace {}: {e}", path.display())))?;
        Ok(())
    }

    async fn replace(&self, session: &SessionId, turns: Vec<ConversationTurn>) -> Result<(), StoreError> {
        self.flush(session, &turns).await?;
        self.cache.write().await.insert(session.clone(), turns.into());
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn append(&self, session: &SessionId, turn: ConversationTurn) -> Result<(), StoreError> {
        let existing = self.load(session).await?;
        let max = self.max_stored_turns.load(Ordering::Relaxed);
        let turns = appended(existing.as_deref().unwrap_or(&[]), turn, max)?;
        self.replace(session, turns).await
    }

    async fn snapshot(&self, session: &SessionId) -> Result<ConversationSnapshot, StoreError> {
        let turns = self
            .load(session)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session.to_string()))?;
        Ok(ConversationSnapshot {
            session_id: session.clone(),
            turns,
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
        let turns = self
            .load(session)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session.to_string()))?;
        let evicted = turns.len().saturating_sub(keep_last);
        if evicted > 0 {
            self.replace(session, turns[evicted..].to_vec()).await?;
            debug!(session = %session, evicted, "Evicted old turns");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextloom_core::message::Message;
    use tempfile::TempDir;

    fn turn(n: u64) -> ConversationTurn {
        ConversationTurn::new(n)
            .with_message(Message::user(format!("question {n}")))
            .with_message(Message::assistant(format!("answer {n}")))
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let session = SessionId::from("persist");
        {
            let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
            store.append(&session, turn(1)).await.unwrap();
            store.append(&session, turn(2)).await.unwrap();
        }

        let reopened = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let snapshot = reopened.snapshot(&session).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.turns()[1].messages[1].content, "answer 2");
    }

    #[tokio::test]
    async fn read_file_parses_session_format() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let session = SessionId::from("abc");
        store.append(&session, turn(4)).await.unwrap();

        let snapshot = JsonFileStore::read_file(&dir.path().join("abc.json")).await.unwrap();
        assert_eq!(snapshot.session_id, session);
        assert_eq!(snapshot.latest_turn_number(), 4);
    }

    #[tokio::test]
    async fn corrupted_file_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.snapshot(&SessionId::from("bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn missing_session_not_found() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.snapshot(&SessionId::from("none")).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn eviction_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let session = SessionId::from("evict");
        let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        for n in 1..=5 {
            store.append(&session, turn(n)).await.unwrap();
        }
        assert_eq!(store.request_eviction(&session, 2).await.unwrap(), 3);

        let reopened = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let numbers: Vec<u64> = reopened
            .snapshot(&session)
            .await
            .unwrap()
            .turns()
            .iter()
            .map(|t| t.turn_number)
            .collect();
        assert_eq!(numbers, vec![4, 5]);
    }

    #[tokio::test]
    async fn unsafe_session_ids_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().to_path_buf()).unwrap();
        let session = SessionId::from("../escape");
        store.append(&session, turn(1)).await.unwrap();
        assert!(dir.path().join("___escape.json").exists());
    }
}
