//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{TierError, TierResult};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use segtier::config::LoggingConfig;
///
/// segtier::logging::init(&LoggingConfig::default())?;
/// tracing::info!("store starting");
/// ```
pub fn init(config: &LoggingConfig) -> TierResult<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(config.level.as_str())
            .map_err(|e| TierError::Config(format!("invalid log level: {}", e)))?
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    let result = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.with_ansi(true)).try_init(),
        (LogFormat::Pretty, false) => registry
            .with(layer.with_ansi(true).without_time())
            .try_init(),
        (LogFormat::Compact, true) => registry.with(layer.compact().with_ansi(true)).try_init(),
        (LogFormat::Compact, false) => registry
            .with(layer.compact().with_ansi(true).without_time())
            .try_init(),
        (LogFormat::Json, true) => registry.with(layer.json()).try_init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).try_init(),
    };

    result.map_err(|e| TierError::Config(format!("logging already initialized: {}", e)))
}
