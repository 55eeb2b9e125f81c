//! Atomic multi-kind publication for the aggregated discovery service.

use std::sync::{Arc, Mutex, PoisonError};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use tracing::info;

use crate::cache::{Snapshot, SnapshotCache};

/// Freshly computed resources. A `None` kind keeps its previously published value.
#[derive(Debug, Clone, Default)]
pub struct ResourcesByKind {
    pub clusters: Option<Vec<Cluster>>,
    pub routes: Option<Vec<RouteConfiguration>>,
    pub listeners: Option<Vec<Listener>>,
    pub secrets: Option<Vec<Secret>>,
}

/// Merges partial updates into a full resource set and publishes it as one
/// versioned snapshot under a single node identity.
#[derive(Debug)]
pub struct SnapshotHandler {
    cache: Arc<SnapshotCache>,
    node_id: String,
    retained: Mutex<Snapshot>,
}

impl SnapshotHandler {
    pub fn new(cache: Arc<SnapshotCache>, node_id: impl Into<String>) -> Self {
        Self { cache, node_id: node_id.into(), retained: Mutex::new(Snapshot::default()) }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Merge `update`, bump the version and publish. Returns the new version.
    pub fn update_snapshot(&self, update: ResourcesByKind) -> u64 {
        let mut retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(clusters) = update.clusters {
            retained.clusters = clusters;
        }
        if let Some(routes) = update.routes {
            retained.routes = routes;
        }
        if let Some(listeners) = update.listeners {
            retained.listeners = listeners;
        }
        if let Some(secrets) = update.secrets {
            retained.secrets = secrets;
        }
        retained.version = retained.version.wrapping_add(1);

        info!(
            node_id = %self.node_id,
            version = retained.version,
            clusters = retained.clusters.len(),
            routes = retained.routes.len(),
            listeners = retained.listeners.len(),
            secrets = retained.secrets.len(),
            "Snapshot updated"
        );

        // Published under the lock so concurrent updates cannot reorder versions.
        self.cache.set_snapshot(&self.node_id, retained.clone());
        retained.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        Cluster { name: name.into(), ..Default::default() }
    }

    #[test]
    fn omitted_kinds_keep_their_previous_value() {
        let cache = Arc::new(SnapshotCache::new());
        let handler = SnapshotHandler::new(cache.clone(), "gatehouse");

        handler.update_snapshot(ResourcesByKind {
            clusters: Some(vec![cluster("default/a/80")]),
            routes: Some(vec![RouteConfiguration {
                name: "ingress_http".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let version = handler.update_snapshot(ResourcesByKind {
            clusters: Some(vec![cluster("default/b/80")]),
            ..Default::default()
        });

        let snapshot = cache.snapshot("gatehouse").unwrap();
        assert_eq!(version, 2);
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.clusters, vec![cluster("default/b/80")]);
        assert_eq!(snapshot.routes.len(), 1);
        assert!(snapshot.listeners.is_empty());
    }

    #[test]
    fn version_increments_on_identical_updates() {
        let handler = SnapshotHandler::new(Arc::new(SnapshotCache::new()), "gatehouse");
        let first = handler.update_snapshot(ResourcesByKind::default());
        let second = handler.update_snapshot(ResourcesByKind::default());
        assert_eq!(second, first + 1);
    }

    #[test]
    fn version_wraps_at_the_ceiling() {
        let cache = Arc::new(SnapshotCache::new());
        let handler = SnapshotHandler::new(cache.clone(), "gatehouse");
        handler.retained.lock().unwrap().version = u64::MAX;

        assert_eq!(handler.update_snapshot(ResourcesByKind::default()), 0);
        assert_eq!(cache.snapshot("gatehouse").unwrap().version, 0);
    }
}
