//! # Structured Logging
//!
//! Subscriber setup and span helpers built on the tracing ecosystem.
//!
//! `RUST_LOG` takes precedence over the configured default directive, so
//! operators can raise verbosity for a single module (for example
//! `RUST_LOG=gatehouse::xds::services=debug`) without redeploying config.

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Create a tracing span for a discovery stream
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $stream_id:expr) => {
        tracing::info_span!(
            "xds_stream",
            operation = %$operation,
            stream_id = $stream_id
        )
    };
    ($operation:expr, $stream_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_stream",
            operation = %$operation,
            stream_id = $stream_id,
            $($field)*
        )
    };
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed or the directive cannot be parsed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.json_logs {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        xds_address = %config.xds.bind_address(),
        node_id = %config.xds.node_id,
        http_listener = %format!("{}:{}", config.translator.http_address, config.translator.http_port),
        https_listener = %format!("{}:{}", config.translator.https_address, config.translator.https_port),
        max_name_length = config.translator.naming.max_name_length,
        metrics_enabled = config.observability.enable_metrics,
        "gatehouse control plane configuration"
    );
}
