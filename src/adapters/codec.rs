//! Line-delimited JSON codec.
//!
//! Frames are UTF-8 JSON documents terminated by `\n` (a trailing `\r` is
//! tolerated). The same codec serves both ends of a connection: the server
//! decodes [`Envelope`](super::protocol::Envelope)s and encodes
//! [`BrokerResponse`](super::protocol::BrokerResponse)s, the client the
//! other way round.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The frame is malformed. The bad line has been consumed.
    Invalid(String),
}

/// Result of encoding a frame.
#[derive(Debug)]
pub enum EncodeResult {
    Ok(Bytes),
    Error(String),
}

/// Trait for protocol codecs.
pub trait ProtocolCodec: Send + Sync {
    /// The message type decoded from the wire.
    type Inbound;

    /// The message type encoded to the wire.
    type Outbound;

    /// Attempt to decode one frame, consuming its bytes on `Complete` and
    /// `Invalid`.
    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Self::Inbound>;

    /// Encode one frame.
    fn encode(&self, message: &Self::Outbound) -> EncodeResult;

    /// Protocol name for logs.
    fn protocol_name(&self) -> &'static str;
}

/// Scan for a LF line ending. Returns the frame length including the LF.
pub fn find_lf(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
}

/// JSON-lines codec decoding `I` and encoding `O`.
pub struct JsonLineCodec<I, O> {
    max_line: usize,
    _types: PhantomData<fn(O) -> I>,
}

impl<I, O> JsonLineCodec<I, O> {
    /// Default maximum line length (1 MiB).
    pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_line(Self::DEFAULT_MAX_LINE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line,
            _types: PhantomData,
        }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }
}

impl<I, O> Default for JsonLineCodec<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> ProtocolCodec for JsonLineCodec<I, O>
where
    I: DeserializeOwned,
    O: Serialize,
{
    type Inbound = I;
    type Outbound = O;

    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<I> {
        let Some(len) = find_lf(buffer) else {
            if buffer.len() > self.max_line {
                let dropped = buffer.len();
                buffer.clear();
                return DecodeResult::Invalid(format!(
                    "line exceeds {} bytes ({} buffered)",
                    self.max_line, dropped
                ));
            }
            return DecodeResult::Incomplete;
        };

        let line = buffer.split_to(len);
        if len - 1 > self.max_line {
            return DecodeResult::Invalid(format!(
                "line exceeds {} bytes ({} received)",
                self.max_line,
                len - 1
            ));
        }
        let mut body = &line[..len - 1];
        if body.last() == Some(&b'\r') {
            body = &body[..body.len() - 1];
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return DecodeResult::Invalid("empty line".to_string());
        }

        match serde_json::from_slice(body) {
            Ok(message) => DecodeResult::Complete(message),
            Err(e) => DecodeResult::Invalid(format!("malformed json: {}", e)),
        }
    }

    fn encode(&self, message: &O) -> EncodeResult {
        match serde_json::to_vec(message) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                EncodeResult::Ok(Bytes::from(bytes))
            }
            Err(e) => EncodeResult::Error(e.to_string()),
        }
    }

    fn protocol_name(&self) -> &'static str {
        "json-lines"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::protocol::{BrokerRequest, BrokerResponse, Envelope, ResponseBody};

    type ServerCodec = JsonLineCodec<Envelope, BrokerResponse>;

    #[test]
    fn test_find_lf() {
        assert_eq!(find_lf(b"hello\nworld"), Some(6));
        assert_eq!(find_lf(b"hello\r\n"), Some(7));
        assert_eq!(find_lf(b"hello"), None);
    }

    #[test]
    fn decodes_pipelined_lines() {
        let codec = ServerCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"user\":\"a\",\"request\":{\"op\":\"list_targets\"}}\r\n{\"user\":\"b\",\"req"[..],
        );
        match codec.decode(&mut buf) {
            DecodeResult::Complete(env) => {
                assert_eq!(env.user, "a");
                assert_eq!(env.request, BrokerRequest::ListTargets);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(codec.decode(&mut buf), DecodeResult::Incomplete));
        buf.extend_from_slice(b"uest\":{\"op\":\"listing\"}}\n");
        assert!(matches!(codec.decode(&mut buf), DecodeResult::Complete(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_line_is_consumed() {
        let codec = ServerCodec::new();
        let mut buf = BytesMut::from(&b"{not json}\n"[..]);
        assert!(matches!(codec.decode(&mut buf), DecodeResult::Invalid(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_line_rejected() {
        let codec = ServerCodec::with_max_line(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(codec.decode(&mut buf), DecodeResult::Invalid(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_line_with_terminator_rejected() {
        let codec = ServerCodec::with_max_line(8);
        let mut buf = BytesMut::from(&b"{\"user\":\"alice\"}\n{}"[..]);
        match codec.decode(&mut buf) {
            DecodeResult::Invalid(reason) => assert!(reason.contains("exceeds 8 bytes")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(&buf[..], b"{}");

        // Exactly at the limit reaches the JSON parser.
        let mut buf = BytesMut::from(&b"12345678\n"[..]);
        match codec.decode(&mut buf) {
            DecodeResult::Invalid(reason) => assert!(reason.contains("malformed json")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_one_line() {
        let codec = ServerCodec::new();
        match codec.encode(&BrokerResponse::Ok(ResponseBody::empty())) {
            EncodeResult::Ok(bytes) => assert_eq!(&bytes[..], b"{\"status\":\"ok\"}\n"),
            EncodeResult::Error(e) => panic!("{}", e),
        }
    }
}
