//! Configuration management.

use crate::error::{KilnError, Result};
use crate::ioset::DEFAULT_PIPE_CAPACITY;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistent configuration for Kiln.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter directive when `RUST_LOG` is unset.
    pub log_level: String,
    /// Capacity in bytes of process pipes and forwarder reads.
    pub io_buffer_size: usize,
    /// Capacity of status event channels.
    pub status_buffer: usize,
    /// Reference name the controller answers to.
    pub reference: String,
    /// Invoke flag used when the caller gives none.
    pub default_invoke: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            io_buffer_size: DEFAULT_PIPE_CAPACITY,
            status_buffer: 128,
            reference: "local".to_string(),
            default_invoke: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Atomically write configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| KilnError::IoError { path: parent.to_path_buf(), source: e })?;

        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| KilnError::IoError { path: parent.to_path_buf(), source: e })?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| KilnError::IoError { path: tmp.path().to_path_buf(), source: e })?;
        tmp.persist(path)
            .map_err(|e| KilnError::IoError { path: path.to_path_buf(), source: e.error })?;
        Ok(())
    }

    /// Reject values the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.io_buffer_size == 0 {
            return Err(KilnError::InvalidConfig { reason: "io_buffer_size must be positive".into() });
        }
        if self.status_buffer == 0 {
            return Err(KilnError::InvalidConfig { reason: "status_buffer must be positive".into() });
        }
        if self.reference.is_empty() {
            return Err(KilnError::InvalidConfig { reason: "reference must not be empty".into() });
        }
        if let Some(invoke) = &self.default_invoke {
            invoke.parse::<crate::invoke::InvokeRequest>().map_err(|e| KilnError::InvalidConfig {
                reason: format!("Invalid default_invoke: {}", e),
            })?;
        }
        Ok(())
    }
}
