//! Envoy xDS (eXtended Discovery Service) implementation
//!
//! Translates the routing graph into Envoy resources and serves them:
//! - CDS, RDS, LDS and SDS as individual streams backed by [`crate::cache::XdsCaches`]
//! - ADS backed by versioned snapshots in [`crate::cache::SnapshotCache`]

pub mod cluster;
pub mod handler;
pub mod listener;
pub mod naming;
pub mod route;
pub mod secret;
pub mod server;
pub mod services;
pub mod snapshot;

pub use handler::{CacheHandler, LoggingStatusWriter, MetricsWriter, StatusWriter};
pub use server::serve;
pub use snapshot::{ResourcesByKind, SnapshotHandler};

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, AggregatedConfigSource, ApiVersion, ConfigSource,
};
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::errors::{Error, Result};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Resource kinds this control plane serves.
pub const SERVED_TYPE_URLS: [&str; 4] =
    [CLUSTER_TYPE_URL, ROUTE_TYPE_URL, LISTENER_TYPE_URL, SECRET_TYPE_URL];

/// Endpoints are announced by a separate component; the type URL is only
/// recognised so requests for it can be told apart from garbage.
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

pub(crate) const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
pub(crate) const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub(crate) const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub(crate) const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

/// Wrap a resource in its wire envelope.
pub fn to_any<M: Message>(type_url: &'static str, message: &M) -> Result<Any> {
    let mut value = Vec::with_capacity(message.encoded_len());
    message.encode(&mut value).map_err(|source| Error::Serialization { type_url, source })?;
    Ok(Any { type_url: type_url.to_string(), value })
}

/// Config source telling Envoy to fetch a dependent resource over its ADS stream.
pub(crate) fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource::default())),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

pub(crate) fn proto_duration(duration: std::time::Duration) -> Duration {
    Duration { seconds: duration.as_secs() as i64, nanos: duration.subsec_nanos() as i32 }
}

pub(crate) fn uint32(value: Option<u32>) -> Option<UInt32Value> {
    value.map(|v| UInt32Value { value: v })
}
