//! Envelope encoding and decoding.

use bytes::Bytes;
use prost::Message;

use crate::descriptor::{RequestDescriptor, ResponseDescriptor};
use crate::error::WireError;

/// Current envelope version.
pub const WIRE_VERSION: u32 = 1;

/// Default limit on a buffered request or response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024; // 8 MiB

/// Allowance on top of the body limit for method, URL and headers.
const HEADER_HEADROOM_BYTES: usize = 1024 * 1024;

/// Headers that only make sense for the hop between caller and proxy.
/// They are never forwarded to the client agent.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[derive(Clone, PartialEq, Message)]
struct Envelope {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(oneof = "envelope::Payload", tags = "2, 3")]
    payload: Option<envelope::Payload>,
}

mod envelope {
    use crate::descriptor::{RequestDescriptor, ResponseDescriptor};

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub(super) enum Payload {
        #[prost(message, tag = "2")]
        Request(RequestDescriptor),
        #[prost(message, tag = "3")]
        Response(ResponseDescriptor),
    }

    impl Payload {
        pub(super) fn kind(&self) -> &'static str {
            match self {
                Payload::Request(_) => "request",
                Payload::Response(_) => "response",
            }
        }
    }
}

use envelope::Payload;

/// Encoder/decoder with a body size limit.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_body_bytes: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_BYTES)
    }
}

impl Codec {
    /// Create a codec that refuses bodies above `max_body_bytes`.
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }

    /// Body limit in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Limit on a whole encoded message.
    pub fn max_message_bytes(&self) -> usize {
        self.max_body_bytes.saturating_add(HEADER_HEADROOM_BYTES)
    }

    /// Encode a request, dropping hop-by-hop headers.
    pub fn encode_request(&self, request: &RequestDescriptor) -> Result<Bytes, WireError> {
        self.check_body(request.body.len())?;

        let mut forwarded = request.clone();
        forwarded.headers.retain(|h| !is_hop_by_hop(&h.name));

        Ok(seal(Payload::Request(forwarded)))
    }

    /// Decode a request blob.
    pub fn decode_request(&self, data: &[u8]) -> Result<RequestDescriptor, WireError> {
        match self.open(data)? {
            Payload::Request(request) => {
                self.check_body(request.body.len())?;
                Ok(request)
            }
            other => Err(WireError::UnexpectedPayload {
                expected: "request",
                found: other.kind(),
            }),
        }
    }

    /// Encode a response.
    pub fn encode_response(&self, response: &ResponseDescriptor) -> Result<Bytes, WireError> {
        self.check_body(response.body.len())?;
        Ok(seal(Payload::Response(response.clone())))
    }

    /// Decode a response blob.
    pub fn decode_response(&self, data: &[u8]) -> Result<ResponseDescriptor, WireError> {
        match self.open(data)? {
            Payload::Response(response) => {
                self.check_body(response.body.len())?;
                Ok(response)
            }
            other => Err(WireError::UnexpectedPayload {
                expected: "response",
                found: other.kind(),
            }),
        }
    }

    fn open(&self, data: &[u8]) -> Result<Payload, WireError> {
        let limit = self.max_message_bytes();
        if data.len() > limit {
            return Err(WireError::MessageTooLarge {
                size: data.len(),
                limit,
            });
        }

        let envelope = Envelope::decode(data)?;
        if envelope.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(envelope.version));
        }
        envelope.payload.ok_or(WireError::MissingPayload)
    }

    fn check_body(&self, size: usize) -> Result<(), WireError> {
        if size > self.max_body_bytes {
            return Err(WireError::BodyTooLarge {
                size,
                limit: self.max_body_bytes,
            });
        }
        Ok(())
    }
}

fn seal(payload: Payload) -> Bytes {
    let envelope = Envelope {
        version: WIRE_VERSION,
        payload: Some(payload),
    };
    Bytes::from(envelope.encode_to_vec())
}

/// Encode a request with the default limits.
pub fn encode_request(request: &RequestDescriptor) -> Result<Bytes, WireError> {
    Codec::default().encode_request(request)
}

/// Decode a request with the default limits.
pub fn decode_request(data: &[u8]) -> Result<RequestDescriptor, WireError> {
    Codec::default().decode_request(data)
}

/// Encode a response with the default limits.
pub fn encode_response(response: &ResponseDescriptor) -> Result<Bytes, WireError> {
    Codec::default().encode_response(response)
}

/// Decode a response with the default limits.
pub fn decode_response(data: &[u8]) -> Result<ResponseDescriptor, WireError> {
    Codec::default().decode_response(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Header;
    use proptest::prelude::*;

    fn sample_request() -> RequestDescriptor {
        RequestDescriptor::new("POST", "http://example.com/upload?x=1")
            .with_header("Accept", "*/*")
            .with_header("X-Trace", "a")
            .with_header("X-Trace", "b")
            .with_body(&b"payload"[..])
    }

    #[test]
    fn test_request_roundtrip_preserves_header_order() {
        let request = sample_request();
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();

        assert_eq!(decoded, request);
        let names: Vec<_> = decoded.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["Accept", "X-Trace", "X-Trace"]);
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let request = sample_request()
            .with_header("Proxy-Authorization", "Basic YWxpY2U6")
            .with_header("proxy-connection", "keep-alive")
            .with_header("Transfer-Encoding", "chunked");

        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();

        assert!(decoded.header("proxy-authorization").is_none());
        assert!(decoded.header("proxy-connection").is_none());
        assert!(decoded.header("transfer-encoding").is_none());
        assert_eq!(decoded.headers.len(), 3);
    }

    #[test]
    fn test_response_roundtrip() {
        let response = ResponseDescriptor::new(404, "Not Found")
            .with_header("Content-Type", "text/plain")
            .with_body(&b"missing"[..]);
        let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_wrong_payload_kind_is_rejected() {
        let blob = encode_request(&sample_request()).unwrap();
        assert!(matches!(
            decode_response(&blob),
            Err(WireError::UnexpectedPayload {
                expected: "response",
                found: "request"
            })
        ));
    }

    #[test]
    fn test_garbage_and_empty_blobs_are_rejected() {
        assert!(matches!(
            decode_request(&[0xff, 0xff, 0xff]),
            Err(WireError::Decode(_))
        ));
        // An empty blob decodes to version 0.
        assert!(matches!(
            decode_request(&[]),
            Err(WireError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let envelope = Envelope {
            version: 7,
            payload: Some(Payload::Request(sample_request())),
        };
        let blob = envelope.encode_to_vec();
        assert!(matches!(
            decode_request(&blob),
            Err(WireError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_body_limit() {
        let codec = Codec::new(4);
        let request = RequestDescriptor::new("PUT", "http://example.com/").with_body(&b"12345"[..]);
        assert!(matches!(
            codec.encode_request(&request),
            Err(WireError::BodyTooLarge { size: 5, limit: 4 })
        ));

        // A peer with a larger limit can still not push an oversized body through.
        let blob = Codec::new(16).encode_request(&request).unwrap();
        assert!(matches!(
            codec.decode_request(&blob),
            Err(WireError::BodyTooLarge { .. })
        ));
    }

    fn header_strategy() -> impl Strategy<Value = Header> {
        ("[A-Za-z][A-Za-z0-9-]{0,15}", prop::collection::vec(any::<u8>(), 0..32))
            .prop_filter("hop-by-hop headers are stripped", |(name, _)| {
                !is_hop_by_hop(name)
            })
            .prop_map(|(name, value)| Header::new(name, value))
    }

    proptest! {
        #[test]
        fn prop_request_roundtrip(
            method in "[A-Z]{3,7}",
            url in "http://[a-z]{1,12}\\.test/[a-z0-9/]{0,24}",
            headers in prop::collection::vec(header_strategy(), 0..8),
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let request = RequestDescriptor {
                method,
                url,
                headers,
                body: Bytes::from(body),
            };
            let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
            prop_assert_eq!(decoded, request);
        }

        #[test]
        fn prop_response_roundtrip(
            status_code in 100u16..600,
            headers in prop::collection::vec(header_strategy(), 0..8),
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let response = ResponseDescriptor::new(status_code, "Reason")
                .with_body(body);
            let response = ResponseDescriptor { headers, ..response };
            let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();
            prop_assert_eq!(decoded, response);
        }
    }
}
