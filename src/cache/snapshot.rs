//! Versioned, all-kinds snapshots keyed by node id.
//!
//! This is the delivery path used by the aggregated discovery service: each
//! recomputation publishes one immutable [`Snapshot`] holding every kind, and
//! subscribers observe it through a `watch` channel.

use std::sync::Arc;

use dashmap::DashMap;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::watch;
use tracing::debug;

use super::resource::XdsResource;
use crate::errors::{Error, Result};
use crate::xds::{self, CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, SECRET_TYPE_URL};

/// One consistent generation of every resource kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
    pub secrets: Vec<Secret>,
}

impl Snapshot {
    pub fn version_info(&self) -> String {
        self.version.to_string()
    }

    /// Encoded resources for `type_url`, filtered to `names` when non-empty.
    pub fn resources(&self, type_url: &str, names: &[String]) -> Result<Vec<Any>> {
        match type_url {
            CLUSTER_TYPE_URL => encode(&self.clusters, names),
            ROUTE_TYPE_URL => encode(&self.routes, names),
            LISTENER_TYPE_URL => encode(&self.listeners, names),
            SECRET_TYPE_URL => encode(&self.secrets, names),
            other => Err(Error::UnknownTypeUrl(other.to_string())),
        }
    }

    pub fn total_resources(&self) -> usize {
        self.clusters.len() + self.routes.len() + self.listeners.len() + self.secrets.len()
    }
}

fn encode<T: XdsResource>(values: &[T], names: &[String]) -> Result<Vec<Any>> {
    values
        .iter()
        .filter(|v| names.is_empty() || names.iter().any(|n| n == v.name()))
        .map(|v| xds::to_any(T::TYPE_URL, v))
        .collect()
}

type SnapshotSender = watch::Sender<Option<Arc<Snapshot>>>;

/// Latest snapshot per node, observable by any number of streams.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    nodes: DashMap<String, SnapshotSender>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, node_id: &str) -> SnapshotSender {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Publish `snapshot` as the current state for `node_id`.
    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) {
        debug!(
            node_id = %node_id,
            version = snapshot.version,
            resources = snapshot.total_resources(),
            "publishing snapshot"
        );
        self.sender(node_id).send_replace(Some(Arc::new(snapshot)));
    }

    pub fn snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.nodes.get(node_id).and_then(|tx| tx.borrow().clone())
    }

    /// Watch `node_id`. The receiver sees the current snapshot, if any, as unseen.
    pub fn subscribe(&self, node_id: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        let mut rx = self.sender(node_id).subscribe();
        rx.mark_changed();
        rx
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
