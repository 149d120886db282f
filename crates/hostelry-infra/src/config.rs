//! Configuration loader for Hostelry.
//!
//! Reads `config.toml` from the data directory (`~/.hostelry/` by default)
//! and deserializes its `[engine]` table into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use hostelry_types::config::{EngineConfig, GlobalConfig};

/// Resolve the data directory: `HOSTELRY_DATA_DIR`, else `~/.hostelry`.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HOSTELRY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hostelry")
}

/// Load the full configuration file from `{data_dir}/config.toml`.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Engine settings from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    load_global_config(data_dir).await.engine
}
