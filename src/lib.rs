//! # Gatehouse
//!
//! The xDS core of an ingress controller: translates a validated routing
//! graph into Envoy clusters, routes, listeners and secrets, and streams them
//! to connected proxies.
//!
//! ## Architecture
//!
//! ```text
//! routing graph → visitors → per-kind caches ──→ CDS / RDS / LDS / SDS streams
//!                     │
//!                     └────→ snapshot store ──→ ADS streams
//! ```
//!
//! ## Core Components
//!
//! - **Routing graph** ([`dag`]): the closed set of vertices the visitors walk
//! - **Caches** ([`cache`]): `ResourceCache<T>` with its notification bus, and the snapshot store
//! - **Translation and delivery** ([`xds`]): naming, visitors, `CacheHandler`, tonic services
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gatehouse::cache::{SnapshotCache, XdsCaches};
//! use gatehouse::config::AppConfig;
//! use gatehouse::dag::Dag;
//! use gatehouse::xds::{self, CacheHandler, SnapshotHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> gatehouse::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let caches = XdsCaches::new();
//!     let snapshots = Arc::new(SnapshotCache::new());
//!
//!     let handler = CacheHandler::new(config.translator.clone(), caches.clone())
//!         .with_snapshots(SnapshotHandler::new(snapshots.clone(), config.xds.node_id.clone()));
//!     handler.on_change(&Dag::default());
//!
//!     xds::serve(&config.xds, caches, snapshots, CancellationToken::new()).await
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dag;
pub mod errors;
pub mod observability;
pub mod xds;

pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "gatehouse");
    }
}
