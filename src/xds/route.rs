//! Route visitor: builds the `ingress_http` and `ingress_https` route
//! configurations from the graph's virtual hosts.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier,
    redirect_action::SchemeRewriteSpecifier,
    route::Action,
    route_action::{ClusterSpecifier, RequestMirrorPolicy, UpgradeConfig},
    route_match::PathSpecifier,
    weighted_cluster::ClusterWeight,
    HeaderMatcher, RedirectAction, RetryPolicy, Route, RouteAction, RouteConfiguration,
    RouteMatch, VirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::UInt32Value;
use tracing::trace;

use crate::config::{NamingConfig, TranslatorConfig};
use crate::dag::{self, Dag, HeaderCondition, PathMatch, RouteTimeout, Vertex};
use crate::xds::naming::{cluster_name, hashname};
use crate::xds::{proto_duration, uint32};

pub const HTTP_ROUTE_CONFIG: &str = "ingress_http";
pub const HTTPS_ROUTE_CONFIG: &str = "ingress_https";

const REQUEST_START_HEADER: &str = "x-request-start";
const REQUEST_START_VALUE: &str = "t=%START_TIME(%s.%3f)%";

/// Build both route configurations. They are always present, even when empty,
/// because the listeners reference them by name.
pub fn visit_routes(config: &TranslatorConfig, dag: &Dag) -> BTreeMap<String, RouteConfiguration> {
    let mut visitor = RouteVisitor { naming: &config.naming, http: Vec::new(), https: Vec::new() };
    dag.visit(|vertex| visitor.visit(vertex));

    let mut routes = BTreeMap::new();
    let configs = [(HTTP_ROUTE_CONFIG, visitor.http), (HTTPS_ROUTE_CONFIG, visitor.https)];
    for (name, mut vhosts) in configs {
        vhosts.sort_by(|a, b| a.name.cmp(&b.name));
        routes.insert(
            name.to_string(),
            RouteConfiguration {
                name: name.to_string(),
                virtual_hosts: vhosts,
                ..Default::default()
            },
        );
    }
    routes
}

struct RouteVisitor<'c> {
    naming: &'c NamingConfig,
    http: Vec<VirtualHost>,
    https: Vec<VirtualHost>,
}

impl RouteVisitor<'_> {
    fn visit(&mut self, vertex: Vertex<'_>) {
        match vertex {
            Vertex::VirtualHost(vh) => {
                if let Some(vhost) = self.virtual_host(vh, false) {
                    self.http.push(vhost);
                }
            }
            Vertex::SecureVirtualHost(svh) => {
                // TCP proxied hosts never reach the HTTP connection manager.
                if svh.tcp_proxy.is_none() {
                    if let Some(vhost) = self.virtual_host(&svh.host, true) {
                        self.https.push(vhost);
                    }
                }
            }
            _ => vertex.visit_children(|child| self.visit(child)),
        }
    }

    fn virtual_host(&self, vh: &dag::VirtualHost, secure: bool) -> Option<VirtualHost> {
        let mut sorted: Vec<&dag::Route> = vh.routes.iter().collect();
        sorted.sort_by(|a, b| compare_routes(a, b));

        let routes: Vec<Route> =
            sorted.into_iter().filter_map(|r| self.route(r, secure)).collect();
        if routes.is_empty() {
            return None;
        }

        trace!(vhost = %vh.name, routes = routes.len(), secure, "building virtual host");
        Some(VirtualHost {
            name: hashname(self.naming, &[&vh.name]),
            domains: domains(&vh.name),
            routes,
            ..Default::default()
        })
    }

    fn route(&self, route: &dag::Route, secure: bool) -> Option<Route> {
        let r#match = Some(route_match(route));

        if route.https_upgrade && !secure {
            return Some(Route {
                r#match,
                action: Some(Action::Redirect(RedirectAction {
                    scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
                    ..Default::default()
                })),
                ..Default::default()
            });
        }

        let cluster_specifier = self.cluster_specifier(&route.clusters)?;
        Some(Route {
            r#match,
            action: Some(Action::Route(self.route_action(route, cluster_specifier))),
            request_headers_to_add: vec![HeaderValueOption {
                header: Some(HeaderValue {
                    key: REQUEST_START_HEADER.to_string(),
                    value: REQUEST_START_VALUE.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn cluster_specifier(&self, clusters: &[dag::Cluster]) -> Option<ClusterSpecifier> {
        match clusters {
            [] => None,
            [single] => Some(ClusterSpecifier::Cluster(cluster_name(self.naming, single))),
            many => Some(ClusterSpecifier::WeightedClusters(self.weighted_clusters(many))),
        }
    }

    fn weighted_clusters(&self, clusters: &[dag::Cluster]) -> WeightedCluster {
        let mut total = clusters.iter().fold(0u32, |acc, c| acc.saturating_add(c.weight));
        let even = total == 0;
        if even {
            total = clusters.len() as u32;
        }

        let mut weights: Vec<ClusterWeight> = clusters
            .iter()
            .map(|c| ClusterWeight {
                name: cluster_name(self.naming, c),
                weight: Some(UInt32Value { value: if even { 1 } else { c.weight } }),
                ..Default::default()
            })
            .collect();
        weights.sort_by(|a, b| {
            a.name.cmp(&b.name).then_with(|| {
                let wa = a.weight.as_ref().map(|w| w.value);
                let wb = b.weight.as_ref().map(|w| w.value);
                wa.cmp(&wb)
            })
        });

        #[allow(deprecated)]
        let weighted =
            WeightedCluster { clusters: weights, total_weight: uint32(Some(total)), ..Default::default() };
        weighted
    }

    fn route_action(&self, route: &dag::Route, cluster_specifier: ClusterSpecifier) -> RouteAction {
        #[allow(deprecated)]
        let mut action =
            RouteAction { cluster_specifier: Some(cluster_specifier), ..Default::default() };

        match route.timeout {
            RouteTimeout::Default => {}
            RouteTimeout::Infinite => action.timeout = Some(proto_duration(std::time::Duration::ZERO)),
            RouteTimeout::After(d) => action.timeout = Some(proto_duration(d)),
        }

        if let Some(retry) = &route.retry {
            action.retry_policy = Some(RetryPolicy {
                retry_on: retry.retry_on.clone(),
                num_retries: uint32(Some(retry.num_retries)),
                per_try_timeout: retry.per_try_timeout.map(proto_duration),
                ..Default::default()
            });
        }

        if let Some(prefix) = &route.prefix_rewrite {
            action.prefix_rewrite = prefix.clone();
        }

        if route.websocket {
            action.upgrade_configs =
                vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }];
        }

        if let Some(mirror) = &route.mirror {
            action.request_mirror_policies = vec![RequestMirrorPolicy {
                cluster: cluster_name(self.naming, mirror),
                ..Default::default()
            }];
        }

        action
    }
}

fn domains(host: &str) -> Vec<String> {
    if host == "*" {
        vec!["*".to_string()]
    } else {
        vec![host.to_string(), format!("{}:*", host)]
    }
}

fn route_match(route: &dag::Route) -> RouteMatch {
    let path_specifier = match &route.path {
        PathMatch::Prefix(prefix) => PathSpecifier::Prefix(prefix.clone()),
        PathMatch::Regex(regex) => {
            PathSpecifier::SafeRegex(RegexMatcher { regex: regex.clone(), ..Default::default() })
        }
    };

    RouteMatch {
        path_specifier: Some(path_specifier),
        headers: route.headers.iter().map(header_matcher).collect(),
        ..Default::default()
    }
}

fn header_matcher(header: &dag::HeaderMatch) -> HeaderMatcher {
    let string_match = |pattern: MatchPattern| {
        HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(pattern),
            ..Default::default()
        })
    };
    let specifier = match &header.condition {
        HeaderCondition::Exact(value) => string_match(MatchPattern::Exact(value.clone())),
        HeaderCondition::Contains(value) => string_match(MatchPattern::Contains(value.clone())),
        HeaderCondition::Present => HeaderMatchSpecifier::PresentMatch(true),
    };

    HeaderMatcher {
        name: header.name.clone(),
        invert_match: header.invert,
        header_match_specifier: Some(specifier),
        ..Default::default()
    }
}

/// Most specific first: longer path, then more header conditions, then
/// header names and conditions in lexical order, then path text descending.
fn compare_routes(a: &dag::Route, b: &dag::Route) -> Ordering {
    let (pa, pb) = (a.path.as_str(), b.path.as_str());
    pb.len()
        .cmp(&pa.len())
        .then_with(|| b.headers.len().cmp(&a.headers.len()))
        .then_with(|| {
            let ka = a.headers.iter().map(|h| (h.name.as_str(), h.condition_text()));
            let kb = b.headers.iter().map(|h| (h.name.as_str(), h.condition_text()));
            ka.cmp(kb)
        })
        .then_with(|| pb.cmp(pa))
}
