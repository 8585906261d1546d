//! Client connection handling.
//!
//! Each accepted connection is served by one task: decode every complete
//! line in the read buffer, execute the requests in order, flush the
//! responses, then read more. Requests on one connection never overlap, so
//! responses come back in request order.

use super::codec::{DecodeResult, EncodeResult, JsonLineCodec, ProtocolCodec};
use super::protocol::{BrokerResponse, Envelope, ErrorBody};
use super::service::BrokerService;
use crate::core::error::{CorralError, CorralResult, ErrorKind};
use crate::net::tcp::TcpConnection;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// Server-side codec.
pub type ServerCodec = JsonLineCodec<Envelope, BrokerResponse>;

/// Request counters shared by all connections of an adapter.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub requests_processed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl ConnectionStats {
    pub fn request_processed(&self, failed: bool) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Read once into `buffer`. Returns 0 when the peer closed the stream.
pub async fn read_into_buffer<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    chunk: usize,
) -> CorralResult<usize> {
    buffer.reserve(chunk);
    reader
        .read_buf(buffer)
        .await
        .map_err(|e| CorralError::internal(format!("read error: {}", e)))
}

/// Write out and clear `buffer`.
pub async fn flush_write_buffer<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    buffer: &mut BytesMut,
) -> CorralResult<usize> {
    if buffer.is_empty() {
        return Ok(0);
    }
    writer
        .write_all(buffer)
        .await
        .map_err(|e| CorralError::internal(format!("write error: {}", e)))?;
    let n = buffer.len();
    buffer.clear();
    Ok(n)
}

/// Serve one connection until the peer hangs up, goes idle, or shutdown is
/// signalled.
pub async fn serve_connection(
    connection: TcpConnection,
    service: BrokerService,
    codec: Arc<ServerCodec>,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> CorralResult<()> {
    let id = connection.id;
    let peer = connection.remote_addr;
    let (mut reader, mut writer) = connection.into_split();
    let mut read_buf = BytesMut::with_capacity(8 * 1024);
    let mut write_buf = BytesMut::with_capacity(8 * 1024);

    tracing::debug!(connection = %id, peer = %peer, "connection opened");

    loop {
        loop {
            let response = match codec.decode(&mut read_buf) {
                DecodeResult::Complete(envelope) => {
                    tracing::trace!(
                        connection = %id,
                        user = %envelope.user,
                        server = ?envelope.server,
                        op = envelope.request.op(),
                        "request"
                    );
                    BrokerResponse::from_result(service.handle_envelope(envelope).await)
                }
                DecodeResult::Invalid(reason) => {
                    tracing::debug!(connection = %id, reason = %reason, "rejected frame");
                    BrokerResponse::Error(ErrorBody {
                        kind: ErrorKind::Invalid,
                        message: reason,
                        failures: Vec::new(),
                    })
                }
                DecodeResult::Incomplete => break,
            };
            stats.request_processed(matches!(response, BrokerResponse::Error(_)));
            match codec.encode(&response) {
                EncodeResult::Ok(bytes) => write_buf.extend_from_slice(&bytes),
                EncodeResult::Error(e) => {
                    return Err(CorralError::internal(format!("encode failed: {}", e)))
                }
            }
        }

        let sent = flush_write_buffer(&mut writer, &mut write_buf).await?;
        stats.record_sent(sent as u64);

        let read = tokio::select! {
            result = tokio::time::timeout(idle_timeout, read_into_buffer(&mut reader, &mut read_buf, 4096)) => {
                match result {
                    Ok(read) => read?,
                    Err(_) => {
                        tracing::debug!(connection = %id, "idle timeout");
                        0
                    }
                }
            }
            _ = shutdown_rx.changed() => 0,
        };
        if read == 0 {
            break;
        }
        stats.record_received(read as u64);
    }

    tracing::debug!(connection = %id, peer = %peer, "connection closed");
    Ok(())
}
