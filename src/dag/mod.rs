//! Routing graph consumed by the xDS translator.
//!
//! The graph is built and validated upstream from ingress objects, services and
//! secrets. This module only defines its shape and a single traversal entry
//! point, [`Dag::visit`]. Children are always visited in the order they are
//! stored, so the same graph yields the same traversal every time.

pub mod status;

use std::time::Duration;

pub use status::{
    calculate_route_metrics, NamespaceCounts, ObjectRef, RouteMetrics, Status, StatusKind,
    VhostCounts, VhostKey,
};

/// An immutable routing graph produced by one recomputation.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    roots: Vec<Root>,
    statuses: Vec<Status>,
}

/// Top-level vertices of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    VirtualHost(VirtualHost),
    SecureVirtualHost(SecureVirtualHost),
}

impl Dag {
    pub fn new(roots: Vec<Root>, statuses: Vec<Status>) -> Self {
        Self { roots, statuses }
    }

    /// Calls `f` once for each root vertex. Callers recurse with
    /// [`Vertex::visit_children`].
    pub fn visit<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(Vertex<'a>),
    {
        for root in &self.roots {
            match root {
                Root::VirtualHost(vh) => f(Vertex::VirtualHost(vh)),
                Root::SecureVirtualHost(svh) => f(Vertex::SecureVirtualHost(svh)),
            }
        }
    }

    /// Statuses the graph builder derived for its source objects.
    pub fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// A borrowed view of one graph vertex.
#[derive(Debug, Clone, Copy)]
pub enum Vertex<'a> {
    VirtualHost(&'a VirtualHost),
    SecureVirtualHost(&'a SecureVirtualHost),
    Route(&'a Route),
    TcpProxy(&'a TcpProxy),
    Cluster(&'a Cluster),
    Service(&'a Service),
    Secret(&'a Secret),
}

impl<'a> Vertex<'a> {
    /// Calls `f` for every direct child of this vertex, in graph order.
    pub fn visit_children<F>(self, mut f: F)
    where
        F: FnMut(Vertex<'a>),
    {
        match self {
            Vertex::VirtualHost(vh) => {
                for route in &vh.routes {
                    f(Vertex::Route(route));
                }
            }
            Vertex::SecureVirtualHost(svh) => {
                // A TCP proxied host never routes at L7.
                if svh.tcp_proxy.is_none() {
                    for route in &svh.host.routes {
                        f(Vertex::Route(route));
                    }
                }
                if let Some(secret) = &svh.secret {
                    f(Vertex::Secret(secret));
                }
                if let Some(proxy) = &svh.tcp_proxy {
                    f(Vertex::TcpProxy(proxy));
                }
            }
            Vertex::Route(route) => {
                for cluster in &route.clusters {
                    f(Vertex::Cluster(cluster));
                }
                if let Some(mirror) = &route.mirror {
                    f(Vertex::Cluster(mirror));
                }
            }
            Vertex::TcpProxy(proxy) => {
                for cluster in &proxy.clusters {
                    f(Vertex::Cluster(cluster));
                }
            }
            Vertex::Cluster(cluster) => f(Vertex::Service(&cluster.upstream)),
            Vertex::Service(_) | Vertex::Secret(_) => {}
        }
    }
}

/// A plaintext virtual host. `name` is the hostname, or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,
    pub routes: Vec<Route>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>, routes: Vec<Route>) -> Self {
        Self { name: name.into(), routes }
    }
}

/// A virtual host served on the TLS listener, selected by SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureVirtualHost {
    pub host: VirtualHost,
    /// Absent for TLS passthrough.
    pub secret: Option<Secret>,
    pub min_tls_version: TlsVersion,
    /// When set, connections are proxied at L4 and `host.routes` is not traversed.
    pub tcp_proxy: Option<TcpProxy>,
}

impl SecureVirtualHost {
    pub fn new(host: VirtualHost, secret: Option<Secret>) -> Self {
        Self { host, secret, min_tls_version: TlsVersion::default(), tcp_proxy: None }
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    V1_1,
    V1_2,
    V1_3,
}

/// How a route matches the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    Prefix(String),
    Regex(String),
}

impl PathMatch {
    /// The literal prefix or regular expression text.
    pub fn as_str(&self) -> &str {
        match self {
            PathMatch::Prefix(s) | PathMatch::Regex(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub condition: HeaderCondition,
    pub invert: bool,
}

impl HeaderMatch {
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), condition: HeaderCondition::Exact(value.into()), invert: false }
    }

    pub fn contains(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), condition: HeaderCondition::Contains(value.into()), invert: false }
    }

    pub fn present(name: impl Into<String>) -> Self {
        Self { name: name.into(), condition: HeaderCondition::Present, invert: false }
    }

    /// Text form of the match condition, used as an ordering key.
    pub fn condition_text(&self) -> String {
        let base = match &self.condition {
            HeaderCondition::Exact(v) => format!("exact:{}", v),
            HeaderCondition::Contains(v) => format!("contains:{}", v),
            HeaderCondition::Present => "present".to_string(),
        };
        if self.invert {
            format!("not {}", base)
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderCondition {
    Exact(String),
    Contains(String),
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteTimeout {
    /// Leave Envoy's default in place.
    #[default]
    Default,
    /// Disable the timeout.
    Infinite,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub clusters: Vec<Cluster>,
    /// Redirect plaintext requests to https instead of routing them.
    pub https_upgrade: bool,
    pub websocket: bool,
    pub prefix_rewrite: Option<String>,
    pub timeout: RouteTimeout,
    pub retry: Option<RetryPolicy>,
    pub mirror: Option<Cluster>,
}

impl Route {
    pub fn new(path: PathMatch, clusters: Vec<Cluster>) -> Self {
        Self {
            path,
            headers: Vec::new(),
            clusters,
            https_upgrade: false,
            websocket: false,
            prefix_rewrite: None,
            timeout: RouteTimeout::Default,
            retry: None,
            mirror: None,
        }
    }

    pub fn prefix(prefix: impl Into<String>, clusters: Vec<Cluster>) -> Self {
        Self::new(PathMatch::Prefix(prefix.into()), clusters)
    }

    pub fn with_headers(mut self, headers: Vec<HeaderMatch>) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    RingHash,
    Maglev,
}

impl LoadBalancerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "RoundRobin",
            LoadBalancerStrategy::WeightedLeastRequest => "WeightedLeastRequest",
            LoadBalancerStrategy::Random => "Random",
            LoadBalancerStrategy::RingHash => "RingHash",
            LoadBalancerStrategy::Maglev => "Maglev",
        }
    }
}

/// HTTP health check parameters; unset fields fall back to translator defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthCheck {
    pub path: String,
    pub host: Option<String>,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub unhealthy_threshold: Option<u32>,
    pub healthy_threshold: Option<u32>,
}

/// An upstream as seen from one route, with its balancing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub upstream: Service,
    pub weight: u32,
    pub load_balancer: LoadBalancerStrategy,
    pub health_check: Option<HealthCheck>,
}

impl Cluster {
    pub fn new(upstream: Service) -> Self {
        Self {
            upstream,
            weight: 0,
            load_balancer: LoadBalancerStrategy::default(),
            health_check: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamProtocol {
    #[default]
    Http,
    /// HTTP/2 over TLS
    H2,
    /// HTTP/2 cleartext
    H2c,
    Tls,
}

/// A port on a Kubernetes service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub port: u16,
    pub port_name: String,
    pub protocol: UpstreamProtocol,
    /// Set for `ExternalName` services, resolved by DNS instead of EDS.
    pub external_name: Option<String>,
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

impl Service {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port,
            port_name: String::new(),
            protocol: UpstreamProtocol::default(),
            external_name: None,
            max_connections: None,
            max_pending_requests: None,
            max_requests: None,
            max_retries: None,
        }
    }
}

/// Certificate material, already decoded from the secret store.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl Secret {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        certificate_chain: impl Into<Vec<u8>>,
        private_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
        }
    }
}

// Keeps key material out of logs.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("certificate_chain", &format_args!("{} bytes", self.certificate_chain.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProxy {
    pub clusters: Vec<Cluster>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(dag: &Dag) -> Vec<String> {
        fn walk(v: Vertex<'_>, out: &mut Vec<String>) {
            out.push(match v {
                Vertex::VirtualHost(vh) => format!("vhost:{}", vh.name),
                Vertex::SecureVirtualHost(svh) => format!("svhost:{}", svh.name()),
                Vertex::Route(r) => format!("route:{}", r.path.as_str()),
                Vertex::TcpProxy(_) => "tcpproxy".to_string(),
                Vertex::Cluster(c) => format!("cluster:{}", c.upstream.name),
                Vertex::Service(s) => format!("service:{}/{}", s.namespace, s.name),
                Vertex::Secret(s) => format!("secret:{}", s.name),
            });
            v.visit_children(|child| walk(child, out));
        }
        let mut out = Vec::new();
        dag.visit(|v| walk(v, &mut out));
        out
    }

    #[test]
    fn traversal_is_depth_first_in_graph_order() {
        let backend = Cluster::new(Service::new("default", "backend", 80));
        let dag = Dag::new(
            vec![
                Root::VirtualHost(VirtualHost::new(
                    "www.example.com",
                    vec![Route::prefix("/", vec![backend.clone()])],
                )),
                Root::SecureVirtualHost(SecureVirtualHost::new(
                    VirtualHost::new("secure.example.com", vec![Route::prefix("/api", vec![backend])]),
                    Some(Secret::new("default", "tls", "cert", "key")),
                )),
            ],
            Vec::new(),
        );

        let order = collect(&dag);
        assert_eq!(
            order,
            vec![
                "vhost:www.example.com",
                "route:/",
                "cluster:backend",
                "service:default/backend",
                "svhost:secure.example.com",
                "route:/api",
                "cluster:backend",
                "service:default/backend",
                "secret:tls",
            ]
        );
        assert_eq!(order, collect(&dag));
    }

    #[test]
    fn tcp_proxied_hosts_hide_their_routes() {
        let mut proxied = SecureVirtualHost::new(
            VirtualHost::new(
                "tcp.example.com",
                vec![Route::prefix("/", vec![Cluster::new(Service::new("default", "web", 80))])],
            ),
            None,
        );
        proxied.tcp_proxy = Some(TcpProxy {
            clusters: vec![Cluster::new(Service::new("default", "database", 5432))],
        });
        let dag = Dag::new(vec![Root::SecureVirtualHost(proxied)], Vec::new());

        assert_eq!(
            collect(&dag),
            vec![
                "svhost:tcp.example.com",
                "tcpproxy",
                "cluster:database",
                "service:default/database",
            ]
        );
    }

    #[test]
    fn secret_debug_redacts_key() {
        let secret = Secret::new("default", "tls", "CERT", "SUPERSECRET");
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("SUPERSECRET"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn header_condition_text_includes_inversion() {
        let mut header = HeaderMatch::exact("x-user", "admin");
        assert_eq!(header.condition_text(), "exact:admin");
        header.invert = true;
        assert_eq!(header.condition_text(), "not exact:admin");
        assert_eq!(HeaderMatch::present("x-id").condition_text(), "present");
    }
}
