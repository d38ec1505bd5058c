//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use minutesync_sync::SyncConfig;

const CONFIG_DIR_NAME: &str = "minutesync";
const CONFIG_FILE_NAME: &str = "config.json";

/// Settings loaded from `config.json`.
///
/// The API token itself is never stored; only the name of the environment
/// variable that holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub token_env: String,
    pub mirror_root: PathBuf,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com/v1".to_string(),
            token_env: "MINUTESYNC_TOKEN".to_string(),
            mirror_root: dirs::home_dir().unwrap_or_default().join("MinuteSync"),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Default location under the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("No platform config directory")?;
        Ok(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Read the API token from the configured environment variable.
    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .with_context(|| format!("Set {} to your API token", self.token_env))
    }
}
