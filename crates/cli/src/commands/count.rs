//! `contextloom count`: token counts with the configured strategy.

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use contextloom_engine::context::TokenAccountant;

use super::load_config;

pub async fn run(
    config_path: Option<&Path>,
    text: Option<String>,
    file: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let tokens = TokenAccountant::from_config(&config.tokens, None);

    let input = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    println!("{} tokens ({})", tokens.count(&input), tokens.strategy());
    Ok(())
}
