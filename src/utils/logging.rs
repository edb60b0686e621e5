//! Structured logging initialization.
//!
//! Installs a global `tracing` subscriber configured from
//! [`LoggingConfig`]: console or file output, optional JSON formatting, and a
//! level filter that still honors `RUST_LOG` when set.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber from the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when present. When
/// file output is enabled it replaces console output; the log file is opened
/// in append mode.
///
/// # Errors
/// [`ProtocolError::ConfigError`] when the log file cannot be opened or a
/// global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let result = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError(
                "log_file_path must be specified when log_to_file is true".to_string(),
            )
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
            })?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false);
        if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        }
    } else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        }
    };

    result.map_err(|e| ProtocolError::ConfigError(format!("Failed to install subscriber: {e}")))
}
