//! Per-kind discovery stream loop (CDS, RDS, LDS, SDS).
//!
//! Every pass waits for a request, registers with the cache's notification
//! bus using the last sequence this stream sent, and answers once the bus
//! moves past it:
//!
//! ```text
//! recv request -> register(last, names) -> wait -> contents/query -> send -> recv ...
//! ```
//!
//! The version carried by each response is the cache sequence the contents
//! were read at; the nonce counts responses on this stream. Request versions and nonces are only
//! logged.

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use crate::cache::XdsCaches;
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;

pub type ResponseSender = mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>;

/// Serve one per-kind stream until the client goes away or `cancel` fires.
///
/// Requests with an empty type URL are treated as asking for
/// `default_type_url`. Returns [`Error::Cancelled`] on cancellation, `Ok`
/// when the client closes its side cleanly, and the protocol error otherwise.
pub async fn run_resource_stream<S>(
    caches: &XdsCaches,
    default_type_url: &'static str,
    mut requests: S,
    tx: ResponseSender,
    cancel: CancellationToken,
    recorder: &MetricsRecorder,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin + Send,
{
    let mut last: u64 = 0;
    let mut nonce: u64 = 0;

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            request = requests.next() => match request {
                Some(Ok(request)) => request,
                Some(Err(status)) => {
                    return Err(Error::StreamClosed(format!("receive failed: {}", status.message())))
                }
                None => {
                    debug!("Client closed discovery stream");
                    return Ok(());
                }
            },
        };

        let type_url = if request.type_url.is_empty() {
            default_type_url
        } else {
            request.type_url.as_str()
        };
        let Some(source) = caches.source(type_url) else {
            return Err(Error::UnknownTypeUrl(type_url.to_string()));
        };

        debug!(
            type_url = %type_url,
            version = %request.version_info,
            nonce = %request.response_nonce,
            resource_names = ?request.resource_names,
            "Received discovery request"
        );
        if let Some(detail) = &request.error_detail {
            warn!(
                type_url = %type_url,
                nonce = %request.response_nonce,
                error_code = detail.code,
                error_message = %detail.message,
                "[NACK] Envoy rejected previous response"
            );
            recorder.record_nack(type_url);
        }

        let waiter = source.register(last, &request.resource_names);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tx.closed() => return Err(Error::Cancelled),
            sequence = waiter => {
                sequence.map_err(|_| Error::internal("notification bus dropped a waiter"))?;
            }
        }

        // The read may be newer than the wake-up; version by what is sent.
        let (version, resources) = if request.resource_names.is_empty() {
            source.contents_any()?
        } else {
            source.query_any(&request.resource_names)?
        };
        last = version;

        nonce += 1;
        let response = DiscoveryResponse {
            version_info: last.to_string(),
            resources,
            type_url: source.type_url().to_string(),
            nonce: nonce.to_string(),
            ..Default::default()
        };

        debug!(
            type_url = %response.type_url,
            version = %response.version_info,
            nonce = %response.nonce,
            resource_count = response.resources.len(),
            "Sending discovery response"
        );
        recorder.record_response(&response.type_url, response.resources.len());

        tx.send(Ok(response))
            .await
            .map_err(|_| Error::StreamClosed("discovery response receiver dropped".to_string()))?;
    }
}
