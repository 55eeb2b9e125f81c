//! Cluster visitor: one Envoy cluster per distinct upstream/settings pair.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::cluster::v3::circuit_breakers::Thresholds;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, CommonLbConfig, DiscoveryType, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::{CircuitBreakers, Cluster};
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::{
    address, health_check, socket_address, Address, HealthCheck, Http2ProtocolOptions,
    RoutingPriority, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions,
};
use envoy_types::pb::envoy::r#type::v3::Percent;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use std::time::Duration;
use tracing::trace;

use crate::config::TranslatorConfig;
use crate::dag::{self, Dag, LoadBalancerStrategy, Service, UpstreamProtocol, Vertex};
use crate::xds::naming::{alt_stat_name, cluster_name, eds_service_name};
use crate::xds::{
    ads_config_source, proto_duration, uint32, HTTP_PROTOCOL_OPTIONS_TYPE_URL,
    TLS_TRANSPORT_SOCKET, UPSTREAM_TLS_CONTEXT_TYPE_URL,
};

pub const HEALTHCHECK_HOST: &str = "gatehouse-envoy-healthcheck";
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(10);
const HEALTHCHECK_UNHEALTHY_THRESHOLD: u32 = 3;
const HEALTHCHECK_HEALTHY_THRESHOLD: u32 = 2;

/// Build every cluster referenced by `dag`, keyed by cluster name.
pub fn visit_clusters(config: &TranslatorConfig, dag: &Dag) -> BTreeMap<String, Cluster> {
    let mut visitor = ClusterVisitor { config, clusters: BTreeMap::new() };
    dag.visit(|vertex| visitor.visit(vertex));
    visitor.clusters
}

struct ClusterVisitor<'c> {
    config: &'c TranslatorConfig,
    clusters: BTreeMap<String, Cluster>,
}

impl ClusterVisitor<'_> {
    fn visit(&mut self, vertex: Vertex<'_>) {
        if let Vertex::Cluster(cluster) = vertex {
            let name = cluster_name(&self.config.naming, cluster);
            if !self.clusters.contains_key(&name) {
                trace!(cluster = %name, "building cluster");
                let built = build_cluster(self.config, &name, cluster);
                self.clusters.insert(name, built);
            }
        }
        vertex.visit_children(|child| self.visit(child));
    }
}

fn build_cluster(config: &TranslatorConfig, name: &str, source: &dag::Cluster) -> Cluster {
    let service = &source.upstream;
    let mut cluster = Cluster {
        name: name.to_string(),
        alt_stat_name: alt_stat_name(service),
        connect_timeout: Some(proto_duration(config.connect_timeout())),
        lb_policy: lb_policy(source.load_balancer) as i32,
        common_lb_config: Some(CommonLbConfig {
            healthy_panic_threshold: Some(Percent { value: 0.0 }),
            ..Default::default()
        }),
        ..Default::default()
    };

    match &service.external_name {
        Some(external) => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
            cluster.load_assignment = Some(external_load_assignment(service, external));
        }
        None => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            cluster.eds_cluster_config = Some(EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                service_name: eds_service_name(service),
                ..Default::default()
            });
        }
    }

    if let Some(check) = &source.health_check {
        cluster.health_checks = vec![build_health_check(check)];
    }

    if let Some(breakers) = build_circuit_breakers(service) {
        cluster.circuit_breakers = Some(breakers);
    }

    match service.protocol {
        UpstreamProtocol::Http => {}
        UpstreamProtocol::H2c => {
            cluster.typed_extension_protocol_options = http2_protocol_options();
        }
        UpstreamProtocol::H2 => {
            cluster.typed_extension_protocol_options = http2_protocol_options();
            cluster.transport_socket = Some(upstream_tls_socket(&["h2"]));
        }
        UpstreamProtocol::Tls => {
            cluster.transport_socket = Some(upstream_tls_socket(&[]));
        }
    }

    cluster
}

fn lb_policy(strategy: LoadBalancerStrategy) -> LbPolicy {
    match strategy {
        LoadBalancerStrategy::RoundRobin => LbPolicy::RoundRobin,
        LoadBalancerStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LoadBalancerStrategy::Random => LbPolicy::Random,
        LoadBalancerStrategy::RingHash => LbPolicy::RingHash,
        LoadBalancerStrategy::Maglev => LbPolicy::Maglev,
    }
}

fn external_load_assignment(service: &Service, external: &str) -> ClusterLoadAssignment {
    let endpoint = LbEndpoint {
        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
            address: Some(Address {
                address: Some(address::Address::SocketAddress(SocketAddress {
                    address: external.to_string(),
                    port_specifier: Some(socket_address::PortSpecifier::PortValue(
                        service.port as u32,
                    )),
                    protocol: socket_address::Protocol::Tcp as i32,
                    ..Default::default()
                })),
            }),
            ..Default::default()
        })),
        ..Default::default()
    };

    ClusterLoadAssignment {
        cluster_name: eds_service_name(service),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints: vec![endpoint], ..Default::default() }],
        ..Default::default()
    }
}

fn build_health_check(check: &dag::HealthCheck) -> HealthCheck {
    let host = check.host.clone().unwrap_or_else(|| HEALTHCHECK_HOST.to_string());
    HealthCheck {
        timeout: Some(proto_duration(check.timeout.unwrap_or(HEALTHCHECK_TIMEOUT))),
        interval: Some(proto_duration(check.interval.unwrap_or(HEALTHCHECK_INTERVAL))),
        unhealthy_threshold: uint32(Some(
            check.unhealthy_threshold.unwrap_or(HEALTHCHECK_UNHEALTHY_THRESHOLD),
        )),
        healthy_threshold: uint32(Some(
            check.healthy_threshold.unwrap_or(HEALTHCHECK_HEALTHY_THRESHOLD),
        )),
        health_checker: Some(health_check::HealthChecker::HttpHealthCheck(
            health_check::HttpHealthCheck { host, path: check.path.clone(), ..Default::default() },
        )),
        ..Default::default()
    }
}

fn build_circuit_breakers(service: &Service) -> Option<CircuitBreakers> {
    if service.max_connections.is_none()
        && service.max_pending_requests.is_none()
        && service.max_requests.is_none()
        && service.max_retries.is_none()
    {
        return None;
    }

    Some(CircuitBreakers {
        thresholds: vec![Thresholds {
            priority: RoutingPriority::Default as i32,
            max_connections: uint32(service.max_connections),
            max_pending_requests: uint32(service.max_pending_requests),
            max_requests: uint32(service.max_requests),
            max_retries: uint32(service.max_retries),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn http2_protocol_options() -> HashMap<String, Any> {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            },
        )),
        ..Default::default()
    };

    let any = Any {
        type_url: HTTP_PROTOCOL_OPTIONS_TYPE_URL.to_string(),
        value: options.encode_to_vec(),
    };
    HashMap::from([("envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(), any)])
}

fn upstream_tls_socket(alpn: &[&str]) -> TransportSocket {
    let context = UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: alpn.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }),
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(Any {
            type_url: UPSTREAM_TLS_CONTEXT_TYPE_URL.to_string(),
            value: context.encode_to_vec(),
        })),
    }
}
