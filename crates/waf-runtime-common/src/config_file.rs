//! Configuration file structures for the waf-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`GuestConfig`]: Location of the guest binary

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{DnsConfig, FilterConfig, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = true
///
/// [runtime.pool]
/// max_instances = 64
///
/// [filter]
/// blocked_countries = ["KP"]
///
/// [dns]
/// attempts = 4
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
///
/// [guest]
/// path = "./guest/analyzer.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution, pool).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Request filter configuration.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Reverse-DNS configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Guest binary location.
    #[serde(default)]
    pub guest: GuestConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Where the guest binary is read from at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to the compiled guest module.
    pub path: Option<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.graceful_shutdown);
        assert!(config.guest.path.is_none());
        assert!(config.filter.blocked_countries.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:3000"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        // Defaults applied
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.dns.attempts, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = false
            fuel_metering = true

            [runtime.execution]
            max_fuel = 5_000_000
            timeout_ms = 2000

            [runtime.pool]
            max_instances = 16
            max_idle = 8
            discard_trapped = false

            [filter]
            blocked_countries = ["KP", "XX"]
            max_path_len = 512
            allowed_bot_ttl_secs = 3600
            block_delay_min_ms = 10
            block_delay_max_ms = 20

            [dns]
            nameservers = ["9.9.9.9:53"]
            attempts = 2
            retry_delay_ms = 10

            [server]
            bind_addr = "0.0.0.0:9000"
            graceful_shutdown = false

            [guest]
            path = "./analyzer.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(!config.runtime.engine.pooling_allocator);
        assert!(config.runtime.engine.fuel_metering);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert_eq!(config.runtime.pool.max_instances, 16);
        assert!(!config.runtime.pool.discard_trapped);
        assert!(config.filter.blocked_countries.contains("KP"));
        assert_eq!(config.filter.max_path_len, 512);
        assert_eq!(config.filter.max_user_agent_len, 300);
        assert_eq!(config.filter.block_delay_max_ms, 20);
        assert_eq!(config.dns.nameservers, vec!["9.9.9.9:53".parse().unwrap()]);
        assert_eq!(config.dns.attempts, 2);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert!(!config.server.graceful_shutdown);
        assert_eq!(config.guest.path.as_deref(), Some("./analyzer.wasm"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/waf-runtime.toml");
        tokio_test::assert_err!(&result);
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
