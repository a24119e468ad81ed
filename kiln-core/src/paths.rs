//! Centralized path configuration for Kiln.

use std::path::PathBuf;

/// Get the Kiln configuration directory.
///
/// Resolution order:
/// 1. `KILN_CONFIG_DIR` environment variable
/// 2. `$XDG_CONFIG_HOME/kiln` (or the platform equivalent)
/// 3. `~/.kiln`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KILN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(dir) = dirs::config_dir() {
        return dir.join("kiln");
    }

    dirs::home_dir().map(|h| h.join(".kiln")).unwrap_or_else(|| PathBuf::from(".kiln"))
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}
