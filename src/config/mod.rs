//! # Configuration Management
//!
//! Configuration for the xDS server, the graph translator and observability.
//! Every value has a default and can be overridden with a `GATEHOUSE_*`
//! environment variable.

pub mod settings;

pub use settings::{AppConfig, NamingConfig, ObservabilityConfig, TranslatorConfig, XdsServerConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_from_env() {
        env::set_var("GATEHOUSE_XDS_PORT", "9090");
        env::set_var("GATEHOUSE_HTTPS_PORT", "9443");
        env::set_var("GATEHOUSE_USE_PROXY_PROTOCOL", "true");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.xds.port, 9090);
        assert_eq!(config.translator.https_port, 9443);
        assert!(config.translator.use_proxy_protocol);
        assert_eq!(config.translator.http_port, 8080);

        env::set_var("GATEHOUSE_XDS_PORT", "not-a-port");
        assert!(AppConfig::from_env().is_err());

        env::remove_var("GATEHOUSE_XDS_PORT");
        env::remove_var("GATEHOUSE_HTTPS_PORT");
        env::remove_var("GATEHOUSE_USE_PROXY_PROTOCOL");
    }
}
