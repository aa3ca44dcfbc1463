pub mod analyze;
pub mod assemble;
pub mod config_cmd;
pub mod count;

use std::path::Path;

use anyhow::Context;
use contextloom_config::AppConfig;
use contextloom_core::store::ConversationSnapshot;
use contextloom_store::JsonFileStore;

/// The config at `path`, or the default location with env overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    config.context("Failed to load configuration")
}

pub async fn load_session(path: &Path) -> anyhow::Result<ConversationSnapshot> {
    JsonFileStore::read_file(path)
        .await
        .with_context(|| format!("Failed to load session {}", path.display()))
}
