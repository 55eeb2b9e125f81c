//! Aggregated discovery stream loop backed by the snapshot store.
//!
//! # Protocol Flow
//!
//! 1. **Request**: Envoy subscribes to a type URL; the stream answers from the
//!    current snapshot, or as soon as one is published.
//! 2. **ACK**: a request echoing the last nonce and version for its type is
//!    skipped.
//! 3. **NACK**: a request carrying `error_detail` is logged and counted; the
//!    stream waits for the next snapshot instead of resending the rejected one.
//! 4. **Push**: every new snapshot is pushed to each subscribed type whose last
//!    response carried an older version.

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use super::stream::ResponseSender;
use crate::cache::{Snapshot, SnapshotCache};
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;
use crate::xds::{ENDPOINT_TYPE_URL, SERVED_TYPE_URLS};

/// Last response sent for one type URL.
#[derive(Debug, Clone)]
struct LastSent {
    version: String,
    nonce: String,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    last: Option<LastSent>,
}

struct AdsStream<'a> {
    tx: ResponseSender,
    recorder: &'a MetricsRecorder,
    subscriptions: BTreeMap<String, Subscription>,
    nonce: u64,
}

/// Serve one ADS stream for `node_id` until the client goes away or `cancel` fires.
pub async fn run_aggregated_stream<S>(
    cache: Arc<SnapshotCache>,
    node_id: &str,
    mut requests: S,
    tx: ResponseSender,
    cancel: CancellationToken,
    recorder: &MetricsRecorder,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin + Send,
{
    let mut snapshots = cache.subscribe(node_id);
    let mut stream =
        AdsStream { tx: tx.clone(), recorder, subscriptions: BTreeMap::new(), nonce: 0 };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tx.closed() => return Err(Error::Cancelled),
            request = requests.next() => match request {
                Some(Ok(request)) => {
                    let current = snapshots.borrow().clone();
                    stream.handle_request(request, current.as_deref()).await?;
                }
                Some(Err(status)) => {
                    return Err(Error::StreamClosed(format!("receive failed: {}", status.message())))
                }
                None => {
                    info!("ADS stream ended by client");
                    return Ok(());
                }
            },
            changed = snapshots.changed() => {
                changed.map_err(|_| Error::StreamClosed("snapshot store dropped".to_string()))?;
                let current = snapshots.borrow_and_update().clone();
                if let Some(snapshot) = current {
                    stream.push(&snapshot).await?;
                }
            }
        }
    }
}

impl AdsStream<'_> {
    async fn handle_request(
        &mut self,
        request: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Result<()> {
        debug!(
            type_url = %request.type_url,
            version = %request.version_info,
            nonce = %request.response_nonce,
            node_id = ?request.node.as_ref().map(|n| &n.id),
            "Received discovery request"
        );

        if request.type_url == ENDPOINT_TYPE_URL {
            // Endpoints are announced by a separate component.
            debug!(type_url = %request.type_url, "Ignoring endpoint subscription");
            return Ok(());
        }
        if !SERVED_TYPE_URLS.contains(&request.type_url.as_str()) {
            return Err(Error::UnknownTypeUrl(request.type_url));
        }

        let subscription = self.subscriptions.entry(request.type_url.clone()).or_default();
        let names_changed = subscription.names != request.resource_names;
        subscription.names = request.resource_names.clone();

        if let Some(detail) = &request.error_detail {
            warn!(
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                error_code = detail.code,
                error_message = %detail.message,
                "[NACK] Envoy rejected previous response"
            );
            self.recorder.record_nack(&request.type_url);
            if !names_changed {
                return Ok(());
            }
        }

        let is_ack = subscription.last.as_ref().is_some_and(|last| {
            !request.response_nonce.is_empty()
                && request.response_nonce == last.nonce
                && request.version_info == last.version
                && snapshot.is_some_and(|s| s.version_info() == last.version)
        });
        if is_ack && !names_changed {
            debug!(
                type_url = %request.type_url,
                version = %request.version_info,
                nonce = %request.response_nonce,
                "[ACK] Skipping duplicate discovery request"
            );
            return Ok(());
        }

        match snapshot {
            Some(snapshot) => self.respond(&request.type_url, snapshot).await,
            None => {
                debug!(type_url = %request.type_url, "No snapshot yet, waiting");
                Ok(())
            }
        }
    }

    async fn push(&mut self, snapshot: &Snapshot) -> Result<()> {
        let version = snapshot.version_info();
        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.last.as_ref().map_or(true, |last| last.version != version))
            .map(|(type_url, _)| type_url.clone())
            .collect();

        for type_url in stale {
            self.respond(&type_url, snapshot).await?;
        }
        Ok(())
    }

    async fn respond(&mut self, type_url: &str, snapshot: &Snapshot) -> Result<()> {
        let Some(subscription) = self.subscriptions.get_mut(type_url) else {
            return Ok(());
        };
        let resources = snapshot.resources(type_url, &subscription.names)?;

        self.nonce += 1;
        let response = DiscoveryResponse {
            version_info: snapshot.version_info(),
            resources,
            type_url: type_url.to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        };
        subscription.last =
            Some(LastSent { version: response.version_info.clone(), nonce: response.nonce.clone() });

        debug!(
            type_url = %response.type_url,
            version = %response.version_info,
            nonce = %response.nonce,
            resource_count = response.resources.len(),
            "Sending discovery response"
        );
        self.recorder.record_response(type_url, response.resources.len());

        self.tx
            .send(Ok(response))
            .await
            .map_err(|_| Error::StreamClosed("discovery response receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::google::rpc;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use crate::xds::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL};

    type Requests = mpsc::Sender<std::result::Result<DiscoveryRequest, Status>>;
    type Responses = mpsc::Receiver<std::result::Result<DiscoveryResponse, Status>>;

    fn spawn_stream(
        cache: Arc<SnapshotCache>,
        cancel: CancellationToken,
    ) -> (Requests, Responses, tokio::task::JoinHandle<Result<()>>) {
        let (req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, resp_rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            run_aggregated_stream(
                cache,
                "gatehouse",
                ReceiverStream::new(req_rx),
                resp_tx,
                cancel,
                &MetricsRecorder::new(),
            )
            .await
        });
        (req_tx, resp_rx, handle)
    }

    fn snapshot(version: u64, clusters: &[&str]) -> Snapshot {
        Snapshot {
            version,
            clusters: clusters
                .iter()
                .map(|n| Cluster { name: n.to_string(), ..Default::default() })
                .collect(),
            ..Default::default()
        }
    }

    fn request(type_url: &str, version: &str, nonce: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            version_info: version.to_string(),
            response_nonce: nonce.to_string(),
            ..Default::default()
        }
    }

    async fn next(rx: &mut Responses) -> DiscoveryResponse {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("response in time")
            .expect("stream open")
            .expect("ok response")
    }

    async fn assert_quiet(rx: &mut Responses) {
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn answers_from_snapshot_and_skips_acks() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_snapshot("gatehouse", snapshot(1, &["default/a/80"]));
        let (req_tx, mut resp_rx, _handle) = spawn_stream(cache, CancellationToken::new());

        req_tx.send(Ok(request(CLUSTER_TYPE_URL, "", ""))).await.unwrap();
        let response = next(&mut resp_rx).await;
        assert_eq!(response.version_info, "1");
        assert_eq!(response.nonce, "1");
        assert_eq!(response.resources.len(), 1);

        req_tx.send(Ok(request(CLUSTER_TYPE_URL, "1", "1"))).await.unwrap();
        assert_quiet(&mut resp_rx).await;
    }

    #[tokio::test]
    async fn new_snapshots_are_pushed_to_subscribed_types() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_snapshot("gatehouse", snapshot(1, &["default/a/80"]));
        let (req_tx, mut resp_rx, _handle) = spawn_stream(cache.clone(), CancellationToken::new());

        req_tx.send(Ok(request(CLUSTER_TYPE_URL, "", ""))).await.unwrap();
        req_tx.send(Ok(request(LISTENER_TYPE_URL, "", ""))).await.unwrap();
        next(&mut resp_rx).await;
        next(&mut resp_rx).await;
        assert_quiet(&mut resp_rx).await;

        cache.set_snapshot("gatehouse", snapshot(2, &["default/a/80", "default/b/80"]));
        let mut pushed = vec![next(&mut resp_rx).await, next(&mut resp_rx).await];
        pushed.sort_by(|a, b| a.type_url.cmp(&b.type_url));
        assert_eq!(pushed[0].type_url, CLUSTER_TYPE_URL);
        assert_eq!(pushed[0].version_info, "2");
        assert_eq!(pushed[0].resources.len(), 2);
        assert_eq!(pushed[1].type_url, LISTENER_TYPE_URL);
        assert!(pushed[1].resources.is_empty());
    }

    #[tokio::test]
    async fn requests_before_first_snapshot_are_answered_on_publish() {
        let cache = Arc::new(SnapshotCache::new());
        let (req_tx, mut resp_rx, _handle) = spawn_stream(cache.clone(), CancellationToken::new());

        req_tx.send(Ok(request(CLUSTER_TYPE_URL, "", ""))).await.unwrap();
        assert_quiet(&mut resp_rx).await;

        cache.set_snapshot("gatehouse", snapshot(1, &["default/a/80"]));
        assert_eq!(next(&mut resp_rx).await.version_info, "1");
    }

    #[tokio::test]
    async fn nacks_wait_for_the_next_version() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_snapshot("gatehouse", snapshot(1, &["default/a/80"]));
        let (req_tx, mut resp_rx, _handle) = spawn_stream(cache.clone(), CancellationToken::new());

        req_tx.send(Ok(request(CLUSTER_TYPE_URL, "", ""))).await.unwrap();
        next(&mut resp_rx).await;

        let mut nack = request(CLUSTER_TYPE_URL, "", "1");
        nack.error_detail =
            Some(rpc::Status { code: 3, message: "bad cluster".into(), ..Default::default() });
        req_tx.send(Ok(nack)).await.unwrap();
        assert_quiet(&mut resp_rx).await;

        cache.set_snapshot("gatehouse", snapshot(2, &["default/b/80"]));
        assert_eq!(next(&mut resp_rx).await.version_info, "2");
    }

    #[tokio::test]
    async fn endpoint_subscriptions_are_ignored_and_garbage_rejected() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_snapshot("gatehouse", snapshot(1, &[]));
        let (req_tx, mut resp_rx, handle) = spawn_stream(cache, CancellationToken::new());

        req_tx.send(Ok(request(ENDPOINT_TYPE_URL, "", ""))).await.unwrap();
        assert_quiet(&mut resp_rx).await;

        req_tx.send(Ok(request("type.googleapis.com/garbage", "", ""))).await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::UnknownTypeUrl(_))));
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let cancel = CancellationToken::new();
        let (_req_tx, _resp_rx, handle) =
            spawn_stream(Arc::new(SnapshotCache::new()), cancel.clone());
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancellation());
    }
}
