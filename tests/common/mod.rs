//! Common test utilities for all integration tests.
//!
//! Routing graph fixtures and helpers for decoding discovery responses.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use std::sync::Arc;

use envoy_types::pb::google::protobuf::Any;
use gatehouse::cache::{SnapshotCache, XdsCaches};
use gatehouse::config::TranslatorConfig;
use gatehouse::dag::{
    Cluster, Dag, ObjectRef, Root, Route, Secret, SecureVirtualHost, Service, Status, StatusKind,
    VirtualHost,
};
use gatehouse::xds::{CacheHandler, SnapshotHandler};
use prost::Message;

pub const NODE_ID: &str = "gatehouse";

pub fn backend() -> Cluster {
    Cluster::new(Service::new("default", "backend", 80))
}

/// One ingress: `www.example.com/` to `default/backend:80`.
pub fn basic_ingress() -> Dag {
    Dag::new(
        vec![Root::VirtualHost(VirtualHost::new(
            "www.example.com",
            vec![Route::prefix("/", vec![backend()])],
        ))],
        vec![Status::new(ObjectRef::new("Ingress", "default", "www"), StatusKind::Valid, "valid")
            .with_vhost("www.example.com")
            .as_root()],
    )
}

/// The basic ingress plus a TLS-terminated host sharing the same backend.
pub fn secure_ingress() -> Dag {
    let secret = Secret::new("default", "example-tls", "CERTIFICATE CHAIN", "PRIVATE KEY");
    let secure = SecureVirtualHost::new(
        VirtualHost::new("secure.example.com", vec![Route::prefix("/", vec![backend()])]),
        Some(secret),
    );
    Dag::new(
        vec![
            Root::VirtualHost(VirtualHost::new(
                "www.example.com",
                vec![Route::prefix("/", vec![backend()])],
            )),
            Root::SecureVirtualHost(secure),
        ],
        Vec::new(),
    )
}

/// Caches, snapshot store and a handler feeding both.
pub struct Pipeline {
    pub caches: XdsCaches,
    pub snapshots: Arc<SnapshotCache>,
    pub handler: CacheHandler,
}

pub fn pipeline() -> Pipeline {
    let caches = XdsCaches::new();
    let snapshots = Arc::new(SnapshotCache::new());
    let handler = CacheHandler::new(TranslatorConfig::default(), caches.clone())
        .with_snapshots(SnapshotHandler::new(snapshots.clone(), NODE_ID));
    Pipeline { caches, snapshots, handler }
}

pub fn decode<M: Message + Default>(any: &Any) -> M {
    M::decode(any.value.as_slice()).expect("decodable resource")
}
