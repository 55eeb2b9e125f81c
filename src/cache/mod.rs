//! Resource caches and change notification for discovery streams.

pub mod cond;
pub mod resource;
pub mod snapshot;

use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;

pub use cond::Cond;
pub use resource::{ResourceCache, ResourceSource, XdsResource};
pub use snapshot::{Snapshot, SnapshotCache};

/// The four per-kind caches served by the individual discovery services.
#[derive(Debug, Clone, Default)]
pub struct XdsCaches {
    pub clusters: Arc<ResourceCache<Cluster>>,
    pub routes: Arc<ResourceCache<RouteConfiguration>>,
    pub listeners: Arc<ResourceCache<Listener>>,
    pub secrets: Arc<ResourceCache<Secret>>,
}

impl XdsCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cache serving `type_url`.
    pub fn source(&self, type_url: &str) -> Option<Arc<dyn ResourceSource>> {
        let source: Arc<dyn ResourceSource> = match type_url {
            t if t == Cluster::TYPE_URL => self.clusters.clone(),
            t if t == RouteConfiguration::TYPE_URL => self.routes.clone(),
            t if t == Listener::TYPE_URL => self.listeners.clone(),
            t if t == Secret::TYPE_URL => self.secrets.clone(),
            _ => return None,
        };
        Some(source)
    }
}
