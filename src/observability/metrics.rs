//! # Metrics Collection
//!
//! Prometheus metrics for discovery streams and route object counts.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::ObservabilityConfig;
use crate::dag::RouteMetrics;
use crate::errors::{Error, Result};
use crate::xds::handler::MetricsWriter;

/// Records control plane metrics through the `metrics` facade.
///
/// Without an installed exporter every call is a no-op, so tests and
/// metrics-disabled deployments can share the same code path.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    // Last route metrics published, so label sets that disappear are zeroed.
    previous: Arc<Mutex<RouteMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register metric descriptions with the exporter.
    pub fn describe(&self) {
        describe_gauge!("gatehouse_xds_streams_active", Unit::Count, "Open discovery streams");
        describe_counter!(
            "gatehouse_xds_responses_total",
            Unit::Count,
            "Discovery responses sent, by type URL"
        );
        describe_counter!(
            "gatehouse_xds_nacks_total",
            Unit::Count,
            "Discovery requests rejecting a previous response"
        );
        describe_counter!(
            "gatehouse_cache_updates_total",
            Unit::Count,
            "Cache generations published, by resource kind"
        );
        describe_gauge!("gatehouse_routes_total", Unit::Count, "Route objects per namespace");
        describe_gauge!("gatehouse_routes_valid_total", Unit::Count, "Valid route objects");
        describe_gauge!("gatehouse_routes_invalid_total", Unit::Count, "Invalid route objects");
        describe_gauge!("gatehouse_routes_orphaned_total", Unit::Count, "Orphaned route objects");
        describe_gauge!("gatehouse_routes_root_total", Unit::Count, "Root route objects");
        describe_gauge!(
            "gatehouse_vhost_routes_valid",
            Unit::Count,
            "Valid route objects per virtual host"
        );
        describe_gauge!(
            "gatehouse_vhost_routes_invalid",
            Unit::Count,
            "Invalid route objects per virtual host"
        );
    }

    pub fn record_stream_opened(&self, operation: &'static str) {
        gauge!("gatehouse_xds_streams_active", "operation" => operation).increment(1.0);
    }

    pub fn record_stream_closed(&self, operation: &'static str) {
        gauge!("gatehouse_xds_streams_active", "operation" => operation).decrement(1.0);
    }

    pub fn record_response(&self, type_url: &str, resources: usize) {
        let labels = [("type_url", type_url.to_string())];
        counter!("gatehouse_xds_responses_total", &labels).increment(1);
        gauge!("gatehouse_xds_last_response_resources", &labels).set(resources as f64);
    }

    pub fn record_nack(&self, type_url: &str) {
        let labels = [("type_url", type_url.to_string())];
        counter!("gatehouse_xds_nacks_total", &labels).increment(1);
    }

    pub fn record_cache_update(&self, kind: &'static str, resources: usize) {
        counter!("gatehouse_cache_updates_total", "kind" => kind).increment(1);
        gauge!("gatehouse_cache_resources", "kind" => kind).set(resources as f64);
    }
}

impl MetricsWriter for MetricsRecorder {
    fn set_route_metrics(&self, metrics: &RouteMetrics) {
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);

        for namespace in previous.by_namespace.keys() {
            if !metrics.by_namespace.contains_key(namespace) {
                let labels = [("namespace", namespace.clone())];
                for name in [
                    "gatehouse_routes_total",
                    "gatehouse_routes_valid_total",
                    "gatehouse_routes_invalid_total",
                    "gatehouse_routes_orphaned_total",
                    "gatehouse_routes_root_total",
                ] {
                    gauge!(name, &labels).set(0.0);
                }
            }
        }
        for key in previous.by_vhost.keys() {
            if !metrics.by_vhost.contains_key(key) {
                let labels = [("vhost", key.vhost.clone()), ("namespace", key.namespace.clone())];
                gauge!("gatehouse_vhost_routes_valid", &labels).set(0.0);
                gauge!("gatehouse_vhost_routes_invalid", &labels).set(0.0);
            }
        }

        for (namespace, counts) in &metrics.by_namespace {
            let labels = [("namespace", namespace.clone())];
            gauge!("gatehouse_routes_total", &labels).set(counts.total as f64);
            gauge!("gatehouse_routes_valid_total", &labels).set(counts.valid as f64);
            gauge!("gatehouse_routes_invalid_total", &labels).set(counts.invalid as f64);
            gauge!("gatehouse_routes_orphaned_total", &labels).set(counts.orphaned as f64);
            gauge!("gatehouse_routes_root_total", &labels).set(counts.root as f64);
        }
        for (key, counts) in &metrics.by_vhost {
            let labels = [("vhost", key.vhost.clone()), ("namespace", key.namespace.clone())];
            gauge!("gatehouse_vhost_routes_valid", &labels).set(counts.valid as f64);
            gauge!("gatehouse_vhost_routes_invalid", &labels).set(counts.invalid as f64);
        }

        *previous = metrics.clone();
    }
}

/// Install the Prometheus exporter. Must be called from within a Tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.metrics_port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::config(format!("Invalid metrics bind address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", crate::APP_NAME)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().describe();
    info!(address = %socket_addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{NamespaceCounts, VhostCounts, VhostKey};

    #[test]
    fn recorder_tracks_last_published_metrics() {
        let recorder = MetricsRecorder::new();
        let mut metrics = RouteMetrics::default();
        metrics.by_namespace.insert(
            "default".into(),
            NamespaceCounts { total: 2, valid: 2, invalid: 0, orphaned: 0, root: 1 },
        );
        metrics.by_vhost.insert(
            VhostKey { vhost: "www.example.com".into(), namespace: "default".into() },
            VhostCounts { valid: 2, invalid: 0 },
        );

        recorder.set_route_metrics(&metrics);
        assert_eq!(*recorder.previous.lock().unwrap(), metrics);

        recorder.set_route_metrics(&RouteMetrics::default());
        assert_eq!(*recorder.previous.lock().unwrap(), RouteMetrics::default());
    }

    #[test]
    fn stream_counters_without_exporter_are_noops() {
        let recorder = MetricsRecorder::new();
        recorder.record_stream_opened("stream_clusters");
        recorder.record_response("type.googleapis.com/envoy.config.cluster.v3.Cluster", 3);
        recorder.record_nack("type.googleapis.com/envoy.config.cluster.v3.Cluster");
        recorder.record_stream_closed("stream_clusters");
    }

    #[test]
    fn disabled_metrics_skip_exporter() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}
