//! # Configuration Settings
//!
//! Defines the configuration structure for the gatehouse control plane.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsServerConfig,

    /// Graph translation configuration
    #[validate(nested)]
    pub translator: TranslatorConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load every section from `GATEHOUSE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            xds: XdsServerConfig::from_env()?,
            translator: TranslatorConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        let t = &self.translator;
        if t.http_port == t.https_port && t.http_address == t.https_address {
            return Err(Error::config("HTTP and HTTPS listeners cannot share an address and port"));
        }

        if t.naming.short_hash_length >= t.naming.max_name_length {
            return Err(Error::config("short_hash_length must be smaller than max_name_length"));
        }

        if self.observability.enable_metrics && self.observability.metrics_port == self.xds.port {
            return Err(Error::config("Metrics and xDS ports cannot be the same"));
        }

        Ok(())
    }
}

/// xDS gRPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsServerConfig {
    /// Server bind address
    #[validate(length(min = 1, message = "Bind address cannot be empty"))]
    pub bind_address: String,

    /// Server port
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Capacity of each stream's outbound response channel
    #[validate(range(min = 1, max = 1024, message = "Channel capacity must be between 1 and 1024"))]
    pub stream_channel_capacity: usize,

    /// Node identity snapshots are published under. Every proxy is served the same snapshot.
    #[validate(length(min = 1, message = "Node id cannot be empty"))]
    pub node_id: String,
}

impl Default for XdsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8001,
            stream_channel_capacity: 16,
            node_id: "gatehouse".to_string(),
        }
    }
}

impl XdsServerConfig {
    /// Socket address string the gRPC server listens on
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Create XdsServerConfig from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_address: env_or("GATEHOUSE_XDS_BIND_ADDRESS", defaults.bind_address)?,
            port: env_or("GATEHOUSE_XDS_PORT", defaults.port)?,
            stream_channel_capacity: env_or(
                "GATEHOUSE_XDS_STREAM_CHANNEL_CAPACITY",
                defaults.stream_channel_capacity,
            )?,
            node_id: env_or("GATEHOUSE_XDS_NODE_ID", defaults.node_id)?,
        })
    }
}

/// Limits applied when deriving wire names for generated resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct NamingConfig {
    /// Upper bound, in bytes, on every derived resource name.
    #[validate(range(min = 8, max = 4096, message = "Max name length must be between 8 and 4096"))]
    pub max_name_length: usize,

    /// Length of the hash suffix that replaces the tail of a truncated component.
    #[validate(range(min = 1, max = 64, message = "Short hash length must be between 1 and 64"))]
    pub short_hash_length: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self { max_name_length: 60, short_hash_length: 6 }
    }
}

/// Settings the visitors need to shape Envoy resources.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TranslatorConfig {
    #[validate(nested)]
    pub naming: NamingConfig,

    /// Address of the plaintext listener
    #[validate(length(min = 1, message = "HTTP address cannot be empty"))]
    pub http_address: String,

    /// Port of the plaintext listener
    #[validate(range(min = 1, message = "HTTP port must be between 1 and 65535"))]
    pub http_port: u16,

    /// Address of the TLS listener
    #[validate(length(min = 1, message = "HTTPS address cannot be empty"))]
    pub https_address: String,

    /// Port of the TLS listener
    #[validate(range(min = 1, message = "HTTPS port must be between 1 and 65535"))]
    pub https_port: u16,

    /// Expect a PROXY protocol header on accepted connections
    pub use_proxy_protocol: bool,

    /// File Envoy writes access logs to
    #[validate(length(min = 1, message = "Access log path cannot be empty"))]
    pub access_log_path: String,

    /// Upstream connect timeout in milliseconds
    #[validate(range(min = 1, max = 60000, message = "Connect timeout must be between 1ms and 60s"))]
    pub connect_timeout_ms: u64,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            naming: NamingConfig::default(),
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
            use_proxy_protocol: false,
            access_log_path: "/dev/stdout".to_string(),
            connect_timeout_ms: 250,
        }
    }
}

impl TranslatorConfig {
    /// Upstream connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Create TranslatorConfig from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            naming: NamingConfig {
                max_name_length: env_or(
                    "GATEHOUSE_MAX_NAME_LENGTH",
                    defaults.naming.max_name_length,
                )?,
                short_hash_length: env_or(
                    "GATEHOUSE_SHORT_HASH_LENGTH",
                    defaults.naming.short_hash_length,
                )?,
            },
            http_address: env_or("GATEHOUSE_HTTP_ADDRESS", defaults.http_address)?,
            http_port: env_or("GATEHOUSE_HTTP_PORT", defaults.http_port)?,
            https_address: env_or("GATEHOUSE_HTTPS_ADDRESS", defaults.https_address)?,
            https_port: env_or("GATEHOUSE_HTTPS_PORT", defaults.https_port)?,
            use_proxy_protocol: env_flag("GATEHOUSE_USE_PROXY_PROTOCOL", defaults.use_proxy_protocol),
            access_log_path: env_or("GATEHOUSE_ACCESS_LOG_PATH", defaults.access_log_path)?,
            connect_timeout_ms: env_or("GATEHOUSE_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
        })
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Default log directive, overridden by `RUST_LOG` when set
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Install the Prometheus exporter
    pub enable_metrics: bool,

    /// Port the Prometheus exporter listens on
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            enable_metrics: false,
            metrics_port: 8002,
        }
    }
}

impl ObservabilityConfig {
    /// Create ObservabilityConfig from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            log_level: env_or("GATEHOUSE_LOG_LEVEL", defaults.log_level)?,
            json_logs: env_flag("GATEHOUSE_JSON_LOGS", defaults.json_logs),
            enable_metrics: env_flag("GATEHOUSE_ENABLE_METRICS", defaults.enable_metrics),
            metrics_port: env_or("GATEHOUSE_METRICS_PORT", defaults.metrics_port)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|s| s.to_lowercase() == "true" || s == "1").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xds.bind_address(), "0.0.0.0:8001");
        assert_eq!(config.translator.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.translator.naming, NamingConfig { max_name_length: 60, short_hash_length: 6 });
    }

    #[test]
    fn listener_ports_must_differ() {
        let mut config = AppConfig::default();
        config.translator.https_port = config.translator.http_port;
        let err = config.validate().expect_err("conflicting listeners");
        assert!(err.to_string().contains("HTTP and HTTPS"));
    }

    #[test]
    fn hash_must_fit_inside_name() {
        let mut config = AppConfig::default();
        config.translator.naming = NamingConfig { max_name_length: 10, short_hash_length: 10 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn range_rules_are_enforced() {
        let mut config = AppConfig::default();
        config.xds.stream_channel_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
