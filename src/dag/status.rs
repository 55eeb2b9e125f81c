//! Validation statuses attached to source objects, and the route metrics
//! aggregated from them.

use std::collections::BTreeMap;
use std::fmt;

/// Identifies the source object a status belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Valid,
    Invalid,
    Orphaned,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Valid => "valid",
            StatusKind::Invalid => "invalid",
            StatusKind::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub object: ObjectRef,
    pub status: StatusKind,
    pub description: String,
    /// Host the object contributes routes to, if it got that far.
    pub vhost: Option<String>,
    /// Whether the object declares a virtual host itself rather than being delegated to.
    pub root: bool,
}

impl Status {
    pub fn new(object: ObjectRef, status: StatusKind, description: impl Into<String>) -> Self {
        Self { object, status, description: description.into(), vhost: None, root: false }
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn as_root(mut self) -> Self {
        self.root = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceCounts {
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub orphaned: u64,
    pub root: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VhostKey {
    pub vhost: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VhostCounts {
    pub valid: u64,
    pub invalid: u64,
}

/// Route object counts derived from one graph's statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMetrics {
    pub by_namespace: BTreeMap<String, NamespaceCounts>,
    pub by_vhost: BTreeMap<VhostKey, VhostCounts>,
}

pub fn calculate_route_metrics(statuses: &[Status]) -> RouteMetrics {
    let mut metrics = RouteMetrics::default();

    for status in statuses {
        let ns = metrics.by_namespace.entry(status.object.namespace.clone()).or_default();
        ns.total += 1;
        match status.status {
            StatusKind::Valid => {
                ns.valid += 1;
                if status.root {
                    ns.root += 1;
                }
            }
            StatusKind::Invalid => ns.invalid += 1,
            StatusKind::Orphaned => ns.orphaned += 1,
        }

        // Orphans never reached a host.
        if status.status == StatusKind::Orphaned {
            continue;
        }
        let key = VhostKey {
            vhost: status.vhost.clone().unwrap_or_default(),
            namespace: status.object.namespace.clone(),
        };
        let vhost = metrics.by_vhost.entry(key).or_default();
        match status.status {
            StatusKind::Valid => vhost.valid += 1,
            StatusKind::Invalid => vhost.invalid += 1,
            StatusKind::Orphaned => {}
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(ns: &str, name: &str) -> ObjectRef {
        ObjectRef::new("IngressRoute", ns, name)
    }

    #[test]
    fn counts_are_grouped_by_namespace_and_vhost() {
        let statuses = vec![
            Status::new(obj("default", "root"), StatusKind::Valid, "valid IngressRoute")
                .with_vhost("www.example.com")
                .as_root(),
            Status::new(obj("default", "child"), StatusKind::Valid, "valid IngressRoute")
                .with_vhost("www.example.com"),
            Status::new(obj("default", "broken"), StatusKind::Invalid, "service not found")
                .with_vhost("www.example.com"),
            Status::new(obj("teamb", "stray"), StatusKind::Orphaned, "not part of a delegation chain"),
        ];

        let metrics = calculate_route_metrics(&statuses);

        assert_eq!(
            metrics.by_namespace["default"],
            NamespaceCounts { total: 3, valid: 2, invalid: 1, orphaned: 0, root: 1 }
        );
        assert_eq!(
            metrics.by_namespace["teamb"],
            NamespaceCounts { total: 1, valid: 0, invalid: 0, orphaned: 1, root: 0 }
        );

        let key = VhostKey { vhost: "www.example.com".into(), namespace: "default".into() };
        assert_eq!(metrics.by_vhost[&key], VhostCounts { valid: 2, invalid: 1 });
        assert_eq!(metrics.by_vhost.len(), 1);
    }

    #[test]
    fn empty_statuses_yield_empty_metrics() {
        assert_eq!(calculate_route_metrics(&[]), RouteMetrics::default());
    }

    #[test]
    fn object_ref_display() {
        assert_eq!(obj("default", "www").to_string(), "IngressRoute default/www");
    }
}
