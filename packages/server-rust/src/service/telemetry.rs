//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

use super::config::{LogFormat, LogLevel};

/// `RUST_LOG` wins over `level` when it is set.
fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// A global subscriber is already installed.
pub fn init_tracing(level: LogLevel, format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(level));
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
