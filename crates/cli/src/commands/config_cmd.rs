//! `contextloom config`: configuration inspection.

use std::path::Path;

use contextloom_config::AppConfig;

use super::load_config;

pub fn run(config_path: Option<&Path>, defaults: bool, path_only: bool) -> anyhow::Result<()> {
    if path_only {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
        println!("{}", path.display());
        return Ok(());
    }

    if defaults {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = contextloom_config::AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }
}
