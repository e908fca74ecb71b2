//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line with source location.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Initialize logging in the requested format.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init(format: LogFormat, level: &str) -> Result<()> {
    match format {
        LogFormat::Pretty => init_logging(level),
        LogFormat::Json => init_logging_json(level),
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```
/// topolab_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for daemons whose output is collected by a log shipper.
pub fn init_logging_json(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
