//! xDS gRPC server: CDS, RDS, LDS and SDS over the per-kind caches, ADS over snapshots.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, Instrument};

use crate::cache::{SnapshotCache, XdsCaches};
use crate::config::XdsServerConfig;
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;
use crate::xds::services::{run_aggregated_stream, run_resource_stream, ResponseSender};
use crate::xds::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL, SECRET_TYPE_URL};
use crate::xds_span;

type ResponseStream = ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;
type DeltaResponseStream = ReceiverStream<std::result::Result<DeltaDiscoveryResponse, Status>>;

/// State shared by every discovery service on one server.
#[derive(Debug, Clone)]
pub struct DiscoveryServer {
    caches: XdsCaches,
    snapshots: Arc<SnapshotCache>,
    node_id: Arc<str>,
    channel_capacity: usize,
    shutdown: CancellationToken,
    next_stream_id: Arc<AtomicU64>,
    recorder: MetricsRecorder,
}

impl DiscoveryServer {
    pub fn new(
        config: &XdsServerConfig,
        caches: XdsCaches,
        snapshots: Arc<SnapshotCache>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            caches,
            snapshots,
            node_id: Arc::from(config.node_id.as_str()),
            channel_capacity: config.stream_channel_capacity,
            shutdown,
            next_stream_id: Arc::new(AtomicU64::new(1)),
            recorder: MetricsRecorder::new(),
        }
    }

    fn channel(&self) -> (ResponseSender, ResponseStream) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        (tx, ReceiverStream::new(rx))
    }

    /// Spawn a per-kind stream task and return its response side.
    fn stream_resources(
        &self,
        operation: &'static str,
        type_url: &'static str,
        requests: Streaming<DiscoveryRequest>,
    ) -> ResponseStream {
        let (tx, rx) = self.channel();
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let caches = self.caches.clone();
        let cancel = self.shutdown.child_token();
        let recorder = self.recorder.clone();

        tokio::spawn(
            async move {
                info!("New discovery stream");
                recorder.record_stream_opened(operation);
                let result =
                    run_resource_stream(&caches, type_url, requests, tx.clone(), cancel, &recorder)
                        .await;
                finish_stream(operation, result, &tx).await;
                recorder.record_stream_closed(operation);
            }
            .instrument(xds_span!(operation, stream_id, type_url = %type_url)),
        );
        rx
    }
}

/// Log how a stream ended and report protocol errors to the client.
async fn finish_stream(operation: &'static str, result: Result<()>, tx: &ResponseSender) {
    match result {
        Ok(()) => info!("Discovery stream closed by client"),
        Err(e) if e.is_cancellation() => info!("Discovery stream cancelled"),
        Err(e) => {
            error!(operation, error = %e, "Discovery stream failed");
            // The client may already be gone.
            let _ = tx.send(Err(Status::from(e))).await;
        }
    }
}

fn unimplemented(operation: &str) -> Status {
    Status::unimplemented(format!("{} is not supported; use the streaming variant", operation))
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = ResponseStream;
    type DeltaClustersStream = DeltaResponseStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamClustersStream>, Status> {
        Ok(Response::new(self.stream_resources(
            "stream_clusters",
            CLUSTER_TYPE_URL,
            request.into_inner(),
        )))
    }

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaClustersStream>, Status> {
        Err(unimplemented("DeltaClusters"))
    }

    async fn fetch_clusters(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(unimplemented("FetchClusters"))
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = ResponseStream;
    type DeltaRoutesStream = DeltaResponseStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(Response::new(self.stream_resources(
            "stream_routes",
            ROUTE_TYPE_URL,
            request.into_inner(),
        )))
    }

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(unimplemented("DeltaRoutes"))
    }

    async fn fetch_routes(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(unimplemented("FetchRoutes"))
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = ResponseStream;
    type DeltaListenersStream = DeltaResponseStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamListenersStream>, Status> {
        Ok(Response::new(self.stream_resources(
            "stream_listeners",
            LISTENER_TYPE_URL,
            request.into_inner(),
        )))
    }

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaListenersStream>, Status> {
        Err(unimplemented("DeltaListeners"))
    }

    async fn fetch_listeners(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(unimplemented("FetchListeners"))
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for DiscoveryServer {
    type StreamSecretsStream = ResponseStream;
    type DeltaSecretsStream = DeltaResponseStream;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamSecretsStream>, Status> {
        Ok(Response::new(self.stream_resources(
            "stream_secrets",
            SECRET_TYPE_URL,
            request.into_inner(),
        )))
    }

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(unimplemented("DeltaSecrets"))
    }

    async fn fetch_secrets(
        &self,
        _request: Request<DiscoveryRequest>,
    ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
        Err(unimplemented("FetchSecrets"))
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        const OPERATION: &str = "stream_aggregated_resources";

        let (tx, rx) = self.channel();
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let snapshots = self.snapshots.clone();
        let node_id = self.node_id.clone();
        let cancel = self.shutdown.child_token();
        let recorder = self.recorder.clone();
        let requests = request.into_inner();

        tokio::spawn(
            async move {
                info!("New ADS stream");
                recorder.record_stream_opened(OPERATION);
                let result = run_aggregated_stream(
                    snapshots,
                    &node_id,
                    requests,
                    tx.clone(),
                    cancel,
                    &recorder,
                )
                .await;
                finish_stream(OPERATION, result, &tx).await;
                recorder.record_stream_closed(OPERATION);
            }
            .instrument(xds_span!(OPERATION, stream_id, node_id = %self.node_id)),
        );

        Ok(Response::new(rx))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(unimplemented("DeltaAggregatedResources"))
    }
}

/// Serve every discovery service on the configured address until `shutdown` fires.
pub async fn serve(
    config: &XdsServerConfig,
    caches: XdsCaches,
    snapshots: Arc<SnapshotCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS address: {}", e)))?;

    let server = DiscoveryServer::new(config, caches, snapshots, shutdown.clone());

    info!(address = %addr, node_id = %config.node_id, "Starting xDS server");

    Server::builder()
        .add_service(ClusterDiscoveryServiceServer::new(server.clone()))
        .add_service(RouteDiscoveryServiceServer::new(server.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(server.clone()))
        .add_service(SecretDiscoveryServiceServer::new(server.clone()))
        .add_service(AggregatedDiscoveryServiceServer::new(server))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("Address already in use") || message.contains("bind") {
                Error::transport(format!(
                    "xDS server failed to bind to {}: port {} is already in use",
                    addr,
                    addr.port()
                ))
            } else {
                Error::transport(format!("xDS server failed: {}", e))
            }
        })?;

    info!("xDS server stopped");
    Ok(())
}
