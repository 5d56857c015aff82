use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{KeypackError, Result};

/// Largest accepted retention window, roughly ten years.
pub const MAX_RETENTION_DAYS: u32 = 3_650;

/// Top-level configuration for the key package store.
///
/// Loaded from `~/.keypack/config.toml` by default. Missing sections fall back
/// to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeypackConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl KeypackConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeypackConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the store cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.retention_days == 0 {
            return Err(KeypackError::Config(
                "storage.retention_days must be at least 1".to_string(),
            ));
        }
        if self.storage.retention_days > MAX_RETENTION_DAYS {
            return Err(KeypackError::Config(format!(
                "storage.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.storage.purge_interval_hours == 0 {
            return Err(KeypackError::Config(
                "storage.purge_interval_hours must be at least 1".to_string(),
            ));
        }
        if self.storage.db_file_name.trim().is_empty() {
            return Err(KeypackError::Config(
                "storage.db_file_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Full path of the package database, with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        resolve_data_dir(&self.general.data_dir).join(&self.storage.db_file_name)
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the package database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.keypack/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Storage and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// File name of the SQLite database inside `data_dir`.
    pub db_file_name: String,
    /// Days of packages kept; older days are purged.
    pub retention_days: u32,
    /// Hours between background purge cycles.
    pub purge_interval_hours: u32,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file_name: "packages.db".to_string(),
            retention_days: 14,
            purge_interval_hours: 24,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Expand `~` to the home directory in a path string.
pub fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

/// Resolve the config file path (`KEYPACK_CONFIG` env, or
/// `~/.keypack/config.toml`).
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("KEYPACK_CONFIG") {
        return PathBuf::from(p);
    }
    resolve_data_dir("~/.keypack/config.toml")
}
