use std::sync::Arc;

use gatehouse::{
    cache::{SnapshotCache, XdsCaches},
    config::AppConfig,
    dag::Dag,
    observability::{init_observability, log_config_info},
    xds::{serve, CacheHandler, SnapshotHandler},
    Result, APP_NAME, VERSION,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    // This must happen before any config is read from environment
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let config = AppConfig::from_env()?;
    config.validate()?;

    init_observability(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting gatehouse xDS control plane");
    log_config_info(&config);

    let caches = XdsCaches::new();
    let snapshots = Arc::new(SnapshotCache::new());
    let handler = CacheHandler::new(config.translator.clone(), caches.clone())
        .with_snapshots(SnapshotHandler::new(snapshots.clone(), config.xds.node_id.clone()));

    // Publish an empty generation so the first requests are answered.
    handler.on_change(&Dag::default());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    if let Err(e) = serve(&config.xds, caches, snapshots, shutdown).await {
        error!(error = %e, "xDS server terminated with error");
        return Err(e);
    }

    info!("Gatehouse stopped");
    Ok(())
}
