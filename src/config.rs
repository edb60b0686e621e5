//! # Configuration Management
//!
//! Centralized configuration for the multiplexer.
//!
//! This module provides structured configuration for servers and clients,
//! including addresses, timeouts, wire limits, and logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides via `from_env()`
//!
//! ## Wire Limits
//! The maximum message size and the pump idle-sleep interval are clamped to
//! safe ranges rather than rejected: out-of-range values are silently pulled
//! to the nearest bound when read through the `effective_*` accessors.

use crate::error::{ProtocolError, Result};
use crate::protocol::zero::Version;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Smallest maximum-message-size a transport may be configured with.
pub const MIN_MESSAGE_SIZE: usize = 512;

/// Largest maximum-message-size a transport may be configured with.
pub const MAX_MESSAGE_SIZE: usize = 6144;

/// Default maximum message body size in bytes.
pub const DEFAULT_MESSAGE_SIZE: usize = 1024;

/// Shortest allowed pump idle-sleep interval.
pub const MIN_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Longest allowed pump idle-sleep interval.
pub const MAX_IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetmuxConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetmuxConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETMUX_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("NETMUX_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(size) = std::env::var("NETMUX_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.transport.max_message_size = val;
            }
        }

        if let Ok(timeout) = std::env::var("NETMUX_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(sleep) = std::env::var("NETMUX_IDLE_SLEEP_MS") {
            if let Ok(val) = sleep.parse::<u64>() {
                config.transport.idle_sleep = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// How long a new connection may take to answer the version handshake
    /// before it is timed out and closed.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Version advertised by the handshake; peers must agree on major and
    /// minor to be admitted.
    #[serde(default)]
    pub version: Version,

    /// Capacity of each connection's outgoing frame queue. Sends block once
    /// a connection's queue is full.
    pub backpressure_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            handshake_timeout: Duration::from_secs(5),
            version: Version::default(),
            backpressure_limit: 64,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Version presented during the handshake.
    #[serde(default)]
    pub version: Version,

    /// Capacity of the outgoing frame queue. Sends block once it is full.
    pub backpressure_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: Duration::from_secs(5),
            version: Version::default(),
            backpressure_limit: 64,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed message body size in bytes. Values outside
    /// [`MIN_MESSAGE_SIZE`]..=[`MAX_MESSAGE_SIZE`] are clamped, not rejected.
    pub max_message_size: usize,

    /// How long the connection pump sleeps when a pass moved no data.
    /// Clamped to [`MIN_IDLE_SLEEP`]..=[`MAX_IDLE_SLEEP`].
    #[serde(with = "duration_serde")]
    pub idle_sleep: Duration,

    /// Timeout for writing a single frame to the stream.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MESSAGE_SIZE,
            idle_sleep: Duration::from_millis(10),
            write_timeout: Duration::from_secs(15),
        }
    }
}

impl TransportConfig {
    /// The configured maximum message size, pulled into the allowed range.
    pub fn effective_max_message_size(&self) -> usize {
        self.max_message_size.clamp(MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE)
    }

    /// The configured idle-sleep interval, pulled into the allowed range.
    pub fn effective_idle_sleep(&self) -> Duration {
        self.idle_sleep.clamp(MIN_IDLE_SLEEP, MAX_IDLE_SLEEP)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        }

        if self.write_timeout.as_millis() < 100 {
            errors.push("Write timeout too short (minimum: 100ms)".to_string());
        } else if self.write_timeout.as_secs() > 300 {
            errors.push("Write timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netmux"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NetmuxConfig::default().validate().is_empty());
    }

    #[test]
    fn transport_limits_are_clamped() {
        let mut transport = TransportConfig::default();
        transport.max_message_size = 10;
        transport.idle_sleep = Duration::from_secs(30);
        assert_eq!(transport.effective_max_message_size(), MIN_MESSAGE_SIZE);
        assert_eq!(transport.effective_idle_sleep(), MAX_IDLE_SLEEP);

        transport.max_message_size = 1_000_000;
        transport.idle_sleep = Duration::from_millis(1);
        assert_eq!(transport.effective_max_message_size(), MAX_MESSAGE_SIZE);
        assert_eq!(transport.effective_idle_sleep(), MIN_IDLE_SLEEP);
    }

    #[test]
    fn toml_roundtrip() {
        let config = NetmuxConfig::default_with_overrides(|c| {
            c.server.address = "0.0.0.0:7777".into();
            c.transport.max_message_size = 2048;
        });
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed = NetmuxConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.server.address, "0.0.0.0:7777");
        assert_eq!(parsed.transport.max_message_size, 2048);
    }

    #[test]
    fn invalid_address_is_reported() {
        let config = NetmuxConfig::default_with_overrides(|c| {
            c.server.address = "not-an-address".into();
        });
        assert!(config.validate_strict().is_err());
    }
}
