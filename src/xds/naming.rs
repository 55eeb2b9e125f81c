//! Deterministic, length-bounded names for generated resources.
//!
//! Names are built by joining components with `/`. When the result does not
//! fit, components are shortened from the right, each keeping a prefix and a
//! short hash of the full original name. If nothing else works the whole name
//! becomes the hash itself.

use sha2::{Digest, Sha256};

use crate::config::NamingConfig;
use crate::dag::{Cluster, Secret, Service};

/// Join `parts` with `/`, shortening as needed so the result is at most
/// `config.max_name_length` bytes.
pub fn hashname(config: &NamingConfig, parts: &[&str]) -> String {
    let limit = config.max_name_length;
    let joined = parts.join("/");
    if limit > joined.len() || parts.is_empty() {
        return joined;
    }

    let hash = hex::encode(Sha256::digest(joined.as_bytes()));
    let short = &hash[..config.short_hash_length.min(hash.len())];
    let share = limit / parts.len();

    let mut parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    for n in (0..parts.len()).rev() {
        parts[n] = truncate(share, &parts[n], short);
        let candidate = parts.join("/");
        if limit > candidate.len() {
            return candidate;
        }
    }

    hash[..hash.len().min(limit)].to_string()
}

/// Shorten `s` to `limit` bytes, ending it with `suffix` when there is room.
fn truncate(limit: usize, s: &str, suffix: &str) -> String {
    if limit >= s.len() {
        return s.to_string();
    }
    if limit > suffix.len() {
        let keep = floor_char_boundary(s, limit - suffix.len());
        return format!("{}{}", &s[..keep], suffix);
    }
    s[..floor_char_boundary(s, limit)].to_string()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn short_digest(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(&digest[..5])
}

/// Name of the Envoy cluster generated for `cluster`.
///
/// The trailing hash covers the balancing and health check settings, so two
/// routes that reach the same service with different settings get distinct
/// clusters.
pub fn cluster_name(config: &NamingConfig, cluster: &Cluster) -> String {
    let mut buf = cluster.load_balancer.as_str().to_string();
    if let Some(hc) = &cluster.health_check {
        if let Some(timeout) = hc.timeout {
            buf.push_str(&format!("{:?}", timeout));
        }
        if let Some(interval) = hc.interval {
            buf.push_str(&format!("{:?}", interval));
        }
        if let Some(threshold) = hc.unhealthy_threshold {
            buf.push_str(&threshold.to_string());
        }
        if let Some(threshold) = hc.healthy_threshold {
            buf.push_str(&threshold.to_string());
        }
        if let Some(host) = &hc.host {
            buf.push_str(host);
        }
        buf.push_str(&hc.path);
    }

    let service = &cluster.upstream;
    let port = service.port.to_string();
    hashname(
        config,
        &[&service.namespace, &service.name, &port, &short_digest(buf.as_bytes())],
    )
}

/// Stats name for a cluster; never shortened.
pub fn alt_stat_name(service: &Service) -> String {
    format!("{}_{}_{}", service.namespace, service.name, service.port)
}

/// EDS service name the endpoint component publishes under.
pub fn eds_service_name(service: &Service) -> String {
    if service.port_name.is_empty() {
        format!("{}/{}", service.namespace, service.name)
    } else {
        format!("{}/{}/{}", service.namespace, service.name, service.port_name)
    }
}

/// Name of the SDS secret generated for `secret`. Changes whenever the key
/// material does, so rotated certificates get a fresh name.
pub fn secret_name(config: &NamingConfig, secret: &Secret) -> String {
    let mut material = Vec::with_capacity(secret.certificate_chain.len() + secret.private_key.len());
    material.extend_from_slice(&secret.certificate_chain);
    material.extend_from_slice(&secret.private_key);
    hashname(config, &[&secret.namespace, &secret.name, &short_digest(&material)])
}
