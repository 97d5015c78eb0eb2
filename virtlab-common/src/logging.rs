//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Pretty,
    /// Newline-delimited JSON for log aggregation
    Json,
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// Logs go to stderr so the apply report on stdout stays machine readable.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Initialize logging with JSON output format.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Initialize logging in the given format.
pub fn init_logging_with_format(level: &str, format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Pretty => init_logging(level),
        LogFormat::Json => init_logging_json(level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_reports_error() {
        let _ = init_logging("debug");
        assert!(init_logging_json("debug").is_err());
    }
}
