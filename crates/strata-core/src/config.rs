use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Name of the config file inside the data root.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Watcher debounce window.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Bounded wait for the project lock before a mutation fails with `Busy`.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    #[serde(default = "default_true")]
    pub auto_complete: bool,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            auto_complete: default_true(),
        }
    }
}

/// Load `<root>/config.toml`, falling back to defaults when it does not exist.
///
/// # Errors
///
/// [`StoreError::Config`] if the file exists but cannot be read or parsed.
pub fn load_config(root: &Path) -> Result<StoreConfig> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(StoreConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| StoreError::Config(format!("failed to read {}: {e}", path.display())))?;

    toml::from_str::<StoreConfig>(&content)
        .map_err(|e| StoreError::Config(format!("failed to parse {}: {e}", path.display())))
}

const fn default_true() -> bool {
    true
}

const fn default_debounce_ms() -> u64 {
    250
}

const fn default_lock_timeout_ms() -> u64 {
    2000
}
