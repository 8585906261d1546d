//! Line-protocol client.
//!
//! Used by the CLI and by [`TcpRemoteBroker`](crate::federation::TcpRemoteBroker).
//! Transport failures surface as `ServerUnavailable` naming the address;
//! errors reported by the server come back as `Remote` with their wire kind.

use super::codec::{DecodeResult, EncodeResult, JsonLineCodec, ProtocolCodec};
use super::connection::{flush_write_buffer, read_into_buffer};
use super::protocol::{BrokerRequest, BrokerResponse, Envelope, ResponseBody};
use crate::core::error::{CorralError, CorralResult};
use bytes::BytesMut;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

type ClientCodec = JsonLineCodec<BrokerResponse, Envelope>;

/// A connection to one broker server acting as one user.
pub struct BrokerClient {
    address: String,
    user: String,
    /// Server the receiving broker should forward requests to.
    server: Option<String>,
    codec: ClientCodec,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl BrokerClient {
    /// Connect within `timeout`.
    pub async fn connect(address: &str, user: &str, timeout: Duration) -> CorralResult<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unavailable(address, format!("connect failed: {}", e))),
            Err(_) => {
                return Err(unavailable(
                    address,
                    format!("connect timed out after {}ms", timeout.as_millis()),
                ))
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self {
            address: address.to_string(),
            user: user.to_string(),
            server: None,
            codec: ClientCodec::new(),
            reader,
            writer,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Ask the connected broker to forward every request to `server`.
    pub fn route_to(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: BrokerRequest) -> CorralResult<ResponseBody> {
        let mut envelope = Envelope::new(self.user.clone(), request);
        envelope.server = self.server.clone();
        match self.codec.encode(&envelope) {
            EncodeResult::Ok(bytes) => self.write_buf.extend_from_slice(&bytes),
            EncodeResult::Error(e) => {
                return Err(CorralError::internal(format!("encode failed: {}", e)))
            }
        }
        flush_write_buffer(&mut self.writer, &mut self.write_buf)
            .await
            .map_err(|e| unavailable(&self.address, e.to_string()))?;

        loop {
            match self.codec.decode(&mut self.read_buf) {
                DecodeResult::Complete(response) => return response.into_result(),
                DecodeResult::Invalid(reason) => {
                    return Err(CorralError::internal(format!(
                        "bad response from {}: {}",
                        self.address, reason
                    )))
                }
                DecodeResult::Incomplete => {}
            }
            let n = read_into_buffer(&mut self.reader, &mut self.read_buf, 8 * 1024)
                .await
                .map_err(|e| unavailable(&self.address, e.to_string()))?;
            if n == 0 {
                return Err(unavailable(&self.address, "connection closed".to_string()));
            }
        }
    }
}

fn unavailable(address: &str, message: String) -> CorralError {
    CorralError::ServerUnavailable {
        server: address.to_string(),
        message,
    }
}
