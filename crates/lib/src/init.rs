//! Initialize the configuration directory: create ~/.parley, a default config, and the data directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `parley init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with the default config if missing (SQLite store under `data/`).
/// - Creates the `data` subdirectory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let mut default_config = Config::default();
        default_config.store.path = Some(PathBuf::from("data").join("parley.db"));
        let json = serde_json::to_string_pretty(&default_config)
            .context("serializing default config")?;
        std::fs::write(config_path, json)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let data = config::data_dir(config_path);
    if !data.exists() {
        std::fs::create_dir_all(&data)
            .with_context(|| format!("creating data directory {}", data.display()))?;
        log::info!("created data directory at {}", data.display());
    } else {
        log::debug!("data directory already exists at {}, skipping", data.display());
    }

    Ok(config_dir.to_path_buf())
}
