//! Conversation stores.
//!
//! Both backends keep each session as an `Arc<[ConversationTurn]>` that is
//! replaced wholesale on append, so a snapshot is a pointer copy and never
//! observes a later write.

pub mod in_memory;
pub mod json_file;

pub use in_memory::InMemoryConversationStore;
pub use json_file::JsonFileStore;

use std::sync::Arc;

use contextloom_config::StoreConfig;
use contextloom_core::error::StoreError;
use contextloom_core::store::ConversationStore;
use contextloom_core::turn::ConversationTurn;

/// Build the store named by `config.backend`.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    let store: Arc<dyn ConversationStore> = match config.backend.as_str() {
        "in_memory" => Arc::new(InMemoryConversationStore::new()),
        "json_file" => {
            let dir = config.path.clone().unwrap_or_else(JsonFileStore::default_dir);
            Arc::new(JsonFileStore::new(dir)?)
        }
        other => {
            return Err(StoreError::Storage(format!(
                "unknown store backend '{other}' (expected in_memory or json_file)"
            )));
        }
    };
    store.set_max_stored_turns(config.max_stored_turns);
    Ok(store)
}

/// `existing` plus `turn`, trimmed to the newest `max` turns.
pub(crate) fn appended(
    existing: &[ConversationTurn],
    turn: ConversationTurn,
    max: usize,
) -> Result<Vec<ConversationTurn>, StoreError> {
    if let Some(last) = existing.last()
        && turn.turn_number <= last.turn_number
    {
        return Err(StoreError::OutOfOrder {
            turn_number: turn.turn_number,
            last: last.turn_number,
        });
    }
    let keep_from = (existing.len() + 1).saturating_sub(max.max(1));
    let mut turns = Vec::with_capacity(existing.len() + 1 - keep_from);
    turns.extend_from_slice(&existing[keep_from..]);
    turns.push(turn);
    Ok(turns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_trims_oldest() {
        let existing: Vec<_> = (1..=3).map(ConversationTurn::new).collect();
        let turns = appended(&existing, ConversationTurn::new(4), 3).unwrap();
        let numbers: Vec<u64> = turns.iter().map(|t| t.turn_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
    }

    #[test]
    fn appended_rejects_stale_turn() {
        let existing = vec![ConversationTurn::new(5)];
        let err = appended(&existing, ConversationTurn::new(5), 10).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { turn_number: 5, last: 5 }));
    }

    #[test]
    fn create_store_by_name() {
        let store = create_store(&StoreConfig::default()).unwrap();
        assert_eq!(store.name(), "in_memory");

        let bad = StoreConfig {
            backend: "postgres".into(),
            ..Default::default()
        };
        assert!(create_store(&bad).is_err());
    }
}
