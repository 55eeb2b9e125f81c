//! Per-kind resource caches served by the individual discovery services.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::oneshot;

use super::cond::Cond;
use crate::errors::Result;
use crate::xds::{self, CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, SECRET_TYPE_URL};

/// An Envoy resource kind that can live in a [`ResourceCache`].
pub trait XdsResource: prost::Message + Clone + PartialEq + Send + Sync + 'static {
    const TYPE_URL: &'static str;

    fn name(&self) -> &str;

    /// Stand-in returned by [`ResourceCache::query`] for a name the cache
    /// does not hold. `None` means missing names are omitted.
    fn placeholder(_name: &str) -> Option<Self> {
        None
    }
}

impl XdsResource for Cluster {
    const TYPE_URL: &'static str = CLUSTER_TYPE_URL;

    fn name(&self) -> &str {
        &self.name
    }
}

impl XdsResource for RouteConfiguration {
    const TYPE_URL: &'static str = ROUTE_TYPE_URL;

    fn name(&self) -> &str {
        &self.name
    }

    // Envoy blocks listener warm-up until every referenced route config
    // arrives, so unknown names get an empty one.
    fn placeholder(name: &str) -> Option<Self> {
        Some(RouteConfiguration { name: name.to_string(), ..Default::default() })
    }
}

impl XdsResource for Listener {
    const TYPE_URL: &'static str = LISTENER_TYPE_URL;

    fn name(&self) -> &str {
        &self.name
    }
}

impl XdsResource for Secret {
    const TYPE_URL: &'static str = SECRET_TYPE_URL;

    fn name(&self) -> &str {
        &self.name
    }
}

/// A named, replace-all set of resources of one kind plus the bus that
/// announces each new generation.
pub struct ResourceCache<T> {
    values: Mutex<Arc<BTreeMap<String, T>>>,
    cond: Arc<Cond>,
}

impl<T: XdsResource> Default for ResourceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.values.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("ResourceCache").field("resources", &len).field("cond", &self.cond).finish()
    }
}

impl<T: XdsResource> ResourceCache<T> {
    pub fn new() -> Self {
        Self { values: Mutex::new(Arc::new(BTreeMap::new())), cond: Arc::new(Cond::new()) }
    }

    /// Replace the whole contents and notify waiters.
    ///
    /// The names that were added, removed or modified are passed to the bus
    /// as hints, so a stream watching other names stays parked. The sequence
    /// advances even when the new contents equal the old; such an update
    /// carries no hints and wakes everyone.
    pub fn update(&self, values: BTreeMap<String, T>) {
        let mut current = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let previous: &BTreeMap<String, T> = &current;
        let changed = changed_names(previous, &values);
        *current = Arc::new(values);
        // Notify under the values lock so a sequence always names the
        // generation that is readable at that sequence.
        self.cond.notify(&changed);
    }

    /// Current sequence together with the contents it announced.
    fn generation(&self) -> (u64, Arc<BTreeMap<String, T>>) {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        (self.cond.sequence(), values.clone())
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, T>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every resource, ordered by name.
    pub fn contents(&self) -> Vec<T> {
        self.snapshot().values().cloned().collect()
    }

    /// The named resources, ordered by name. Missing names are omitted
    /// unless the kind defines a placeholder.
    pub fn query(&self, names: &[String]) -> Vec<T> {
        select(&self.snapshot(), names)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cond(&self) -> &Arc<Cond> {
        &self.cond
    }

    pub fn register(&self, last: u64, hints: &[String]) -> oneshot::Receiver<u64> {
        self.cond.register(last, hints)
    }
}

fn changed_names<T: PartialEq>(
    old: &BTreeMap<String, T>,
    new: &BTreeMap<String, T>,
) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect();
    changed.extend(old.keys().filter(|name| !new.contains_key(*name)).cloned());
    changed
}

fn select<T: XdsResource>(values: &BTreeMap<String, T>, names: &[String]) -> Vec<T> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    sorted.dedup();

    sorted
        .into_iter()
        .filter_map(|name| values.get(name).cloned().or_else(|| T::placeholder(name)))
        .collect()
}

/// Type-erased view of a cache, used by the stream loop to serve any kind.
///
/// Reads return the sequence the contents were published at alongside the
/// encoded resources.
pub trait ResourceSource: Send + Sync {
    fn type_url(&self) -> &'static str;

    fn register(&self, last: u64, hints: &[String]) -> oneshot::Receiver<u64>;

    fn contents_any(&self) -> Result<(u64, Vec<Any>)>;

    fn query_any(&self, names: &[String]) -> Result<(u64, Vec<Any>)>;
}

impl<T: XdsResource> ResourceSource for ResourceCache<T> {
    fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    fn register(&self, last: u64, hints: &[String]) -> oneshot::Receiver<u64> {
        ResourceCache::register(self, last, hints)
    }

    fn contents_any(&self) -> Result<(u64, Vec<Any>)> {
        let (sequence, values) = self.generation();
        let resources =
            values.values().map(|r| xds::to_any(T::TYPE_URL, r)).collect::<Result<_>>()?;
        Ok((sequence, resources))
    }

    fn query_any(&self, names: &[String]) -> Result<(u64, Vec<Any>)> {
        let (sequence, values) = self.generation();
        let resources = select(&values, names)
            .iter()
            .map(|r| xds::to_any(T::TYPE_URL, r))
            .collect::<Result<_>>()?;
        Ok((sequence, resources))
    }
}
