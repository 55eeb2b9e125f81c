//! Recomputation: translate the routing graph and hand the result to every consumer.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::XdsCaches;
use crate::config::TranslatorConfig;
use crate::dag::{calculate_route_metrics, Dag, ObjectRef, RouteMetrics, StatusKind};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::xds::cluster::visit_clusters;
use crate::xds::listener::visit_listeners;
use crate::xds::route::visit_routes;
use crate::xds::secret::visit_secrets;
use crate::xds::snapshot::{ResourcesByKind, SnapshotHandler};

/// Records the outcome of translation against the source objects.
pub trait StatusWriter: Send + Sync {
    fn set_status(&self, object: &ObjectRef, status: StatusKind, description: &str) -> Result<()>;
}

/// Publishes aggregated route counts.
pub trait MetricsWriter: Send + Sync {
    fn set_route_metrics(&self, metrics: &RouteMetrics);
}

/// Status writer that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStatusWriter;

impl StatusWriter for LoggingStatusWriter {
    fn set_status(&self, object: &ObjectRef, status: StatusKind, description: &str) -> Result<()> {
        debug!(object = %object, status = %status, description = %description, "Status recorded");
        Ok(())
    }
}

/// Runs the visitors over a graph and feeds the per-kind caches, the
/// snapshot store and the status and metrics collaborators.
pub struct CacheHandler {
    config: TranslatorConfig,
    caches: XdsCaches,
    snapshots: Option<SnapshotHandler>,
    status_writer: Arc<dyn StatusWriter>,
    metrics_writer: Arc<dyn MetricsWriter>,
    recorder: MetricsRecorder,
}

impl CacheHandler {
    pub fn new(config: TranslatorConfig, caches: XdsCaches) -> Self {
        let recorder = MetricsRecorder::new();
        Self {
            config,
            caches,
            snapshots: None,
            status_writer: Arc::new(LoggingStatusWriter),
            metrics_writer: Arc::new(recorder.clone()),
            recorder,
        }
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotHandler) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_status_writer(mut self, writer: Arc<dyn StatusWriter>) -> Self {
        self.status_writer = writer;
        self
    }

    pub fn with_metrics_writer(mut self, writer: Arc<dyn MetricsWriter>) -> Self {
        self.metrics_writer = writer;
        self
    }

    pub fn caches(&self) -> &XdsCaches {
        &self.caches
    }

    /// Recompute every resource kind from `dag`.
    ///
    /// The per-kind caches are updated one after another; ADS clients see
    /// all kinds change together through the snapshot.
    pub fn on_change(&self, dag: &Dag) {
        let clusters = visit_clusters(&self.config, dag);
        let routes = visit_routes(&self.config, dag);
        let listeners = visit_listeners(&self.config, dag);
        let secrets = visit_secrets(&self.config, dag);

        info!(
            clusters = clusters.len(),
            routes = routes.len(),
            listeners = listeners.len(),
            secrets = secrets.len(),
            "Recomputed xDS resources"
        );

        if let Some(snapshots) = &self.snapshots {
            snapshots.update_snapshot(ResourcesByKind {
                clusters: Some(clusters.values().cloned().collect()),
                routes: Some(routes.values().cloned().collect()),
                listeners: Some(listeners.values().cloned().collect()),
                secrets: Some(secrets.values().cloned().collect()),
            });
        }

        self.recorder.record_cache_update("clusters", clusters.len());
        self.caches.clusters.update(clusters);
        self.recorder.record_cache_update("routes", routes.len());
        self.caches.routes.update(routes);
        self.recorder.record_cache_update("listeners", listeners.len());
        self.caches.listeners.update(listeners);
        self.recorder.record_cache_update("secrets", secrets.len());
        self.caches.secrets.update(secrets);

        self.write_statuses(dag);
        self.metrics_writer.set_route_metrics(&calculate_route_metrics(dag.statuses()));
    }

    fn write_statuses(&self, dag: &Dag) {
        for status in dag.statuses() {
            if let Err(e) =
                self.status_writer.set_status(&status.object, status.status, &status.description)
            {
                warn!(
                    object = %status.object,
                    status = %status.status,
                    description = %status.description,
                    error = %e,
                    "Failed to record status"
                );
            }
        }
    }
}

impl std::fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandler")
            .field("caches", &self.caches)
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use crate::cache::SnapshotCache;
    use crate::dag::{Cluster, Root, Route, Service, Status, VirtualHost};
    use crate::errors::Error;

    struct FailingStatusWriter;

    impl StatusWriter for FailingStatusWriter {
        fn set_status(&self, object: &ObjectRef, _: StatusKind, _: &str) -> Result<()> {
            Err(Error::status(object.to_string(), "conflict"))
        }
    }

    #[derive(Default)]
    struct CapturingMetrics(Mutex<Vec<RouteMetrics>>);

    impl MetricsWriter for CapturingMetrics {
        fn set_route_metrics(&self, metrics: &RouteMetrics) {
            self.0.lock().unwrap().push(metrics.clone());
        }
    }

    fn graph() -> Dag {
        let backend = Cluster::new(Service::new("default", "backend", 80));
        Dag::new(
            vec![Root::VirtualHost(VirtualHost::new(
                "www.example.com",
                vec![Route::prefix("/", vec![backend])],
            ))],
            vec![Status::new(ObjectRef::new("Ingress", "default", "www"), StatusKind::Valid, "valid")
                .with_vhost("www.example.com")
                .as_root()],
        )
    }

    #[test]
    fn recomputation_feeds_caches_and_snapshot() {
        let caches = XdsCaches::new();
        let store = Arc::new(SnapshotCache::new());
        let handler = CacheHandler::new(TranslatorConfig::default(), caches.clone())
            .with_snapshots(SnapshotHandler::new(store.clone(), "gatehouse"));

        handler.on_change(&graph());

        assert_eq!(caches.clusters.len(), 1);
        assert_eq!(caches.routes.len(), 2);
        assert_eq!(caches.listeners.len(), 1);
        assert!(caches.secrets.is_empty());
        assert_eq!(caches.clusters.cond().sequence(), 1);

        let snapshot = store.snapshot("gatehouse").unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.clusters, caches.clusters.contents());
        assert_eq!(snapshot.listeners, caches.listeners.contents());
    }

    #[test]
    fn route_metrics_are_forwarded() {
        let metrics = Arc::new(CapturingMetrics::default());
        let handler = CacheHandler::new(TranslatorConfig::default(), XdsCaches::new())
            .with_metrics_writer(metrics.clone());

        handler.on_change(&graph());

        let published = metrics.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].by_namespace["default"].root, 1);
    }

    #[traced_test]
    #[test]
    fn status_failures_are_logged_not_propagated() {
        let caches = XdsCaches::new();
        let handler = CacheHandler::new(TranslatorConfig::default(), caches.clone())
            .with_status_writer(Arc::new(FailingStatusWriter));

        handler.on_change(&graph());

        assert_eq!(caches.clusters.len(), 1);
        assert!(logs_contain("Failed to record status"));
        assert!(logs_contain("Ingress default/www"));
    }
}
