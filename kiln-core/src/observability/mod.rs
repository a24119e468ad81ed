//! Observability infrastructure: tracing and metrics.
//!
//! Library code only emits `tracing` events and `metrics` updates. Binaries
//! embedding Kiln call [`init`] once at startup to install a subscriber; the
//! metrics recorder is left to the embedder.

use crate::config::Config;
use crate::error::{KilnError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Build the log filter: `RUST_LOG` when set, otherwise `config.log_level`.
pub fn env_filter(config: &Config) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    EnvFilter::try_new(&config.log_level).map_err(|e| KilnError::InvalidConfig {
        reason: format!("Invalid log level {:?}: {}", config.log_level, e),
    })
}

/// Initialize the global tracing subscriber and describe core metrics.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &Config) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(config)?)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| KilnError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    metrics::register_core_metrics();
    tracing::debug!(log_level = %config.log_level, "Observability initialized");

    Ok(())
}
