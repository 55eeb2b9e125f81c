//! Listener visitor: the plaintext `ingress_http` listener and the SNI-routed
//! `ingress_https` listener.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::accesslog::v3::{
    access_log::ConfigType as AccessLogConfigType, AccessLog,
};
use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address, transport_socket::ConfigType as TransportSocketConfigType, Address,
    SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::access_loggers::file::v3::FileAccessLog;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::proxy_protocol::v3::ProxyProtocol;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::{self, ClusterSpecifier},
    TcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    tls_parameters::TlsProtocol, CommonTlsContext, DownstreamTlsContext, SdsSecretConfig,
    TlsParameters,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue};
use prost::Message;
use tracing::trace;

use crate::config::TranslatorConfig;
use crate::dag::{self, Dag, SecureVirtualHost, TlsVersion, Vertex};
use crate::xds::naming::{cluster_name, secret_name};
use crate::xds::route::{HTTPS_ROUTE_CONFIG, HTTP_ROUTE_CONFIG};
use crate::xds::{ads_config_source, DOWNSTREAM_TLS_CONTEXT_TYPE_URL, TLS_TRANSPORT_SOCKET};

pub const HTTP_LISTENER: &str = "ingress_http";
pub const HTTPS_LISTENER: &str = "ingress_https";

pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
const TCP_PROXY_FILTER_NAME: &str = "envoy.filters.network.tcp_proxy";
const TLS_INSPECTOR_NAME: &str = "envoy.filters.listener.tls_inspector";
const PROXY_PROTOCOL_NAME: &str = "envoy.filters.listener.proxy_protocol";
const FILE_ACCESS_LOG_NAME: &str = "envoy.access_loggers.file";

const HTTP_ALPN: &[&str] = &["h2", "http/1.1"];
const NO_ALPN: &[&str] = &[];

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const PROXY_PROTOCOL_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.proxy_protocol.v3.ProxyProtocol";
const FILE_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";

/// Build the listeners the graph needs. Either listener is omitted when no
/// virtual host would be served by it.
pub fn visit_listeners(config: &TranslatorConfig, dag: &Dag) -> BTreeMap<String, Listener> {
    let mut visitor = ListenerVisitor { config, http: false, chains: Vec::new() };
    dag.visit(|vertex| visitor.visit(vertex));

    let mut listeners = BTreeMap::new();
    if visitor.http {
        let listener = visitor.http_listener();
        listeners.insert(listener.name.clone(), listener);
    }
    if !visitor.chains.is_empty() {
        let listener = visitor.https_listener();
        listeners.insert(listener.name.clone(), listener);
    }
    listeners
}

struct ListenerVisitor<'c> {
    config: &'c TranslatorConfig,
    http: bool,
    chains: Vec<(String, FilterChain)>,
}

impl ListenerVisitor<'_> {
    fn visit(&mut self, vertex: Vertex<'_>) {
        match vertex {
            Vertex::VirtualHost(_) => self.http = true,
            Vertex::SecureVirtualHost(svh) => {
                trace!(
                    vhost = %svh.name(),
                    tcp_proxy = svh.tcp_proxy.is_some(),
                    "adding filter chain"
                );
                let chain = self.filter_chain(svh);
                self.chains.push((svh.name().to_string(), chain));
            }
            _ => vertex.visit_children(|child| self.visit(child)),
        }
    }

    fn http_listener(&self) -> Listener {
        Listener {
            name: HTTP_LISTENER.to_string(),
            address: Some(socket_address(&self.config.http_address, self.config.http_port)),
            listener_filters: self.proxy_protocol().into_iter().collect(),
            filter_chains: vec![FilterChain {
                filters: vec![self.http_connection_manager(HTTP_LISTENER, HTTP_ROUTE_CONFIG)],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn https_listener(&mut self) -> Listener {
        let mut chains = std::mem::take(&mut self.chains);
        chains.sort_by(|a, b| a.0.cmp(&b.0));

        let mut listener_filters: Vec<ListenerFilter> =
            self.proxy_protocol().into_iter().collect();
        listener_filters.push(listener_filter_for(
            TLS_INSPECTOR_NAME,
            TLS_INSPECTOR_TYPE_URL,
            &TlsInspector::default(),
        ));

        Listener {
            name: HTTPS_LISTENER.to_string(),
            address: Some(socket_address(&self.config.https_address, self.config.https_port)),
            listener_filters,
            filter_chains: chains.into_iter().map(|(_, chain)| chain).collect(),
            ..Default::default()
        }
    }

    fn filter_chain(&self, svh: &SecureVirtualHost) -> FilterChain {
        let (filter, alpn) = match &svh.tcp_proxy {
            // The backend negotiates the application protocol itself.
            Some(proxy) => (self.tcp_proxy(proxy), NO_ALPN),
            None => (self.http_connection_manager(HTTPS_LISTENER, HTTPS_ROUTE_CONFIG), HTTP_ALPN),
        };

        FilterChain {
            filter_chain_match: Some(FilterChainMatch {
                server_names: vec![svh.name().to_string()],
                ..Default::default()
            }),
            filters: vec![filter],
            transport_socket: svh
                .secret
                .as_ref()
                .map(|secret| self.downstream_tls(secret, svh.min_tls_version, alpn)),
            ..Default::default()
        }
    }

    fn http_connection_manager(&self, stat_prefix: &str, route_config: &str) -> Filter {
        let hcm = HttpConnectionManager {
            stat_prefix: stat_prefix.to_string(),
            codec_type: CodecType::Auto as i32,
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                route_config_name: route_config.to_string(),
                config_source: Some(ads_config_source()),
            })),
            http_filters: vec![router_filter()],
            access_log: vec![self.access_log()],
            use_remote_address: Some(BoolValue { value: true }),
            ..Default::default()
        };

        Filter {
            name: HCM_FILTER_NAME.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(Any {
                type_url: HCM_TYPE_URL.to_string(),
                value: hcm.encode_to_vec(),
            })),
        }
    }

    fn tcp_proxy(&self, proxy: &dag::TcpProxy) -> Filter {
        let naming = &self.config.naming;
        let cluster_specifier = match proxy.clusters.as_slice() {
            [single] => ClusterSpecifier::Cluster(cluster_name(naming, single)),
            many => {
                let even = many.iter().all(|c| c.weight == 0);
                let mut clusters: Vec<tcp_proxy::weighted_cluster::ClusterWeight> = many
                    .iter()
                    .map(|c| tcp_proxy::weighted_cluster::ClusterWeight {
                        name: cluster_name(naming, c),
                        weight: if even { 1 } else { c.weight },
                        ..Default::default()
                    })
                    .collect();
                clusters.sort_by(|a, b| a.name.cmp(&b.name).then(a.weight.cmp(&b.weight)));
                ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster { clusters })
            }
        };

        let tcp = TcpProxy {
            stat_prefix: HTTPS_LISTENER.to_string(),
            cluster_specifier: Some(cluster_specifier),
            access_log: vec![self.access_log()],
            ..Default::default()
        };

        Filter {
            name: TCP_PROXY_FILTER_NAME.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(Any {
                type_url: TCP_PROXY_TYPE_URL.to_string(),
                value: tcp.encode_to_vec(),
            })),
        }
    }

    fn downstream_tls(
        &self,
        secret: &dag::Secret,
        min_version: TlsVersion,
        alpn: &[&str],
    ) -> TransportSocket {
        let context = DownstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                tls_params: Some(TlsParameters {
                    tls_minimum_protocol_version: tls_protocol(min_version) as i32,
                    ..Default::default()
                }),
                tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
                    name: secret_name(&self.config.naming, secret),
                    sds_config: Some(ads_config_source()),
                    ..Default::default()
                }],
                alpn_protocols: alpn.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        };

        TransportSocket {
            name: TLS_TRANSPORT_SOCKET.to_string(),
            config_type: Some(TransportSocketConfigType::TypedConfig(Any {
                type_url: DOWNSTREAM_TLS_CONTEXT_TYPE_URL.to_string(),
                value: context.encode_to_vec(),
            })),
        }
    }

    fn access_log(&self) -> AccessLog {
        let file_log =
            FileAccessLog { path: self.config.access_log_path.clone(), ..Default::default() };
        AccessLog {
            name: FILE_ACCESS_LOG_NAME.to_string(),
            filter: None,
            config_type: Some(AccessLogConfigType::TypedConfig(Any {
                type_url: FILE_ACCESS_LOG_TYPE_URL.to_string(),
                value: file_log.encode_to_vec(),
            })),
        }
    }

    fn proxy_protocol(&self) -> Option<ListenerFilter> {
        self.config.use_proxy_protocol.then(|| {
            listener_filter_for(
                PROXY_PROTOCOL_NAME,
                PROXY_PROTOCOL_TYPE_URL,
                &ProxyProtocol::default(),
            )
        })
    }
}

fn router_filter() -> HttpFilter {
    HttpFilter {
        name: ROUTER_FILTER_NAME.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(Any {
            type_url: ROUTER_TYPE_URL.to_string(),
            value: Router::default().encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn listener_filter_for<M: Message>(name: &str, type_url: &str, config: &M) -> ListenerFilter {
    ListenerFilter {
        name: name.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(Any {
            type_url: type_url.to_string(),
            value: config.encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn socket_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port as u32)),
            protocol: socket_address::Protocol::Tcp as i32,
            ..Default::default()
        })),
    }
}

fn tls_protocol(version: TlsVersion) -> TlsProtocol {
    match version {
        TlsVersion::V1_1 => TlsProtocol::TlSv11,
        TlsVersion::V1_2 => TlsProtocol::TlSv12,
        TlsVersion::V1_3 => TlsProtocol::TlSv13,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Root, Route, Service, TcpProxy as DagTcpProxy, VirtualHost};

    fn backend() -> dag::Cluster {
        dag::Cluster::new(Service::new("default", "backend", 80))
    }

    fn secure(host: &str, secret: Option<dag::Secret>) -> SecureVirtualHost {
        let host = VirtualHost::new(host, vec![Route::prefix("/", vec![backend()])]);
        SecureVirtualHost::new(host, secret)
    }

    fn tls_cert() -> dag::Secret {
        dag::Secret::new("default", "tls", "CHAIN", "KEY")
    }

    fn decode_hcm(filter: &Filter) -> HttpConnectionManager {
        match filter.config_type.as_ref().unwrap() {
            filter::ConfigType::TypedConfig(any) => {
                assert_eq!(any.type_url, HCM_TYPE_URL);
                HttpConnectionManager::decode(any.value.as_slice()).unwrap()
            }
            other => panic!("unexpected filter config {:?}", other),
        }
    }

    fn decode_tls(chain: &FilterChain) -> DownstreamTlsContext {
        match chain.transport_socket.as_ref().unwrap().config_type.as_ref().unwrap() {
            TransportSocketConfigType::TypedConfig(any) => {
                DownstreamTlsContext::decode(any.value.as_slice()).unwrap()
            }
        }
    }

    #[test]
    fn plaintext_only_graph_has_only_http_listener() {
        let dag = Dag::new(
            vec![Root::VirtualHost(VirtualHost::new(
                "www.example.com",
                vec![Route::prefix("/", vec![backend()])],
            ))],
            Vec::new(),
        );
        let listeners = visit_listeners(&TranslatorConfig::default(), &dag);

        assert_eq!(listeners.keys().collect::<Vec<_>>(), vec![HTTP_LISTENER]);
        let http = &listeners[HTTP_LISTENER];
        assert!(http.listener_filters.is_empty());

        let hcm = decode_hcm(&http.filter_chains[0].filters[0]);
        assert_eq!(hcm.stat_prefix, HTTP_LISTENER);
        match hcm.route_specifier.unwrap() {
            RouteSpecifier::Rds(rds) => {
                assert_eq!(rds.route_config_name, HTTP_ROUTE_CONFIG);
                assert_eq!(rds.config_source, Some(ads_config_source()));
            }
            other => panic!("unexpected route specifier {:?}", other),
        }
        assert_eq!(hcm.http_filters[0].name, ROUTER_FILTER_NAME);
        assert_eq!(hcm.access_log[0].name, FILE_ACCESS_LOG_NAME);
    }

    #[test]
    fn secure_only_graph_has_only_https_listener() {
        let dag = Dag::new(
            vec![Root::SecureVirtualHost(secure("www.example.com", Some(tls_cert())))],
            Vec::new(),
        );
        let listeners = visit_listeners(&TranslatorConfig::default(), &dag);
        assert_eq!(listeners.keys().collect::<Vec<_>>(), vec![HTTPS_LISTENER]);

        let https = &listeners[HTTPS_LISTENER];
        assert_eq!(https.listener_filters.len(), 1);
        assert_eq!(https.listener_filters[0].name, TLS_INSPECTOR_NAME);
    }

    #[test]
    fn empty_graph_has_no_listeners() {
        assert!(visit_listeners(&TranslatorConfig::default(), &Dag::default()).is_empty());
    }

    #[test]
    fn filter_chains_are_sorted_by_server_name() {
        let dag = Dag::new(
            vec![
                Root::SecureVirtualHost(secure("www.example.com", Some(tls_cert()))),
                Root::SecureVirtualHost(secure("api.example.com", Some(tls_cert()))),
            ],
            Vec::new(),
        );
        let listeners = visit_listeners(&TranslatorConfig::default(), &dag);
        let names: Vec<&str> = listeners[HTTPS_LISTENER]
            .filter_chains
            .iter()
            .map(|c| c.filter_chain_match.as_ref().unwrap().server_names[0].as_str())
            .collect();
        assert_eq!(names, vec!["api.example.com", "www.example.com"]);
    }

    #[test]
    fn tls_context_references_sds_secret() {
        let config = TranslatorConfig::default();
        let mut svh = secure("www.example.com", Some(tls_cert()));
        svh.min_tls_version = TlsVersion::V1_2;
        let dag = Dag::new(vec![Root::SecureVirtualHost(svh)], Vec::new());

        let listeners = visit_listeners(&config, &dag);
        let ctx = decode_tls(&listeners[HTTPS_LISTENER].filter_chains[0]);
        let common = ctx.common_tls_context.unwrap();

        assert_eq!(common.alpn_protocols, vec!["h2", "http/1.1"]);
        assert_eq!(
            common.tls_params.unwrap().tls_minimum_protocol_version,
            TlsProtocol::TlSv12 as i32
        );
        let sds = &common.tls_certificate_sds_secret_configs[0];
        assert_eq!(sds.name, secret_name(&config.naming, &tls_cert()));
    }

    #[test]
    fn tcp_proxy_chain_has_no_alpn() {
        let mut svh = secure("db.example.com", Some(tls_cert()));
        svh.tcp_proxy = Some(DagTcpProxy { clusters: vec![backend()] });
        let dag = Dag::new(vec![Root::SecureVirtualHost(svh)], Vec::new());

        let listeners = visit_listeners(&TranslatorConfig::default(), &dag);
        let chain = &listeners[HTTPS_LISTENER].filter_chains[0];
        assert_eq!(chain.filters[0].name, TCP_PROXY_FILTER_NAME);
        assert!(decode_tls(chain).common_tls_context.unwrap().alpn_protocols.is_empty());

        let tcp = match chain.filters[0].config_type.as_ref().unwrap() {
            filter::ConfigType::TypedConfig(any) => {
                TcpProxy::decode(any.value.as_slice()).unwrap()
            }
            other => panic!("unexpected filter config {:?}", other),
        };
        match tcp.cluster_specifier.unwrap() {
            ClusterSpecifier::Cluster(name) => assert!(name.starts_with("default/backend/80/")),
            other => panic!("unexpected specifier {:?}", other),
        }
    }

    #[test]
    fn passthrough_has_no_transport_socket() {
        let mut svh = secure("pass.example.com", None);
        svh.tcp_proxy = Some(DagTcpProxy { clusters: vec![backend()] });
        let dag = Dag::new(vec![Root::SecureVirtualHost(svh)], Vec::new());

        let listeners = visit_listeners(&TranslatorConfig::default(), &dag);
        assert!(listeners[HTTPS_LISTENER].filter_chains[0].transport_socket.is_none());
    }

    #[test]
    fn proxy_protocol_and_addresses_follow_config() {
        let config = TranslatorConfig {
            use_proxy_protocol: true,
            http_port: 9080,
            ..Default::default()
        };
        let dag = Dag::new(
            vec![
                Root::VirtualHost(VirtualHost::new("www.example.com", Vec::new())),
                Root::SecureVirtualHost(secure("www.example.com", Some(tls_cert()))),
            ],
            Vec::new(),
        );
        let listeners = visit_listeners(&config, &dag);

        assert_eq!(listeners[HTTP_LISTENER].listener_filters[0].name, PROXY_PROTOCOL_NAME);
        let https_filters: Vec<&str> =
            listeners[HTTPS_LISTENER].listener_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(https_filters, vec![PROXY_PROTOCOL_NAME, TLS_INSPECTOR_NAME]);

        assert_eq!(listeners[HTTP_LISTENER].address, Some(socket_address("0.0.0.0", 9080)));
    }
}
