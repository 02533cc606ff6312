//! Request and response descriptors.
//!
//! The descriptor types double as the protobuf messages of the envelope, so
//! there is no separate DTO layer to keep in sync.

use bytes::Bytes;

/// The CONNECT method, which selects the tunnel relay.
pub const CONNECT: &str = "CONNECT";

/// A single header field. Values are raw bytes; HTTP allows non-UTF-8
/// (obs-text) header values.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl Header {
    /// Create a header field.
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A proxied request: method, target, ordered headers and buffered body.
///
/// For CONNECT the target is the `host:port` authority.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestDescriptor {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "4")]
    pub body: Bytes,
}

impl RequestDescriptor {
    /// Create a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a CONNECT request for `host:port`.
    pub fn connect(authority: impl Into<String>) -> Self {
        Self::new(CONNECT, authority)
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether this request opens a tunnel.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case(CONNECT)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }
}

/// A proxied response: status line, code, ordered headers and buffered body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseDescriptor {
    /// Status line without the protocol version, e.g. `200 OK`.
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(uint32, tag = "2")]
    pub status_code: u32,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "4")]
    pub body: Bytes,
}

impl ResponseDescriptor {
    /// Create a response with the given code and reason phrase.
    pub fn new(status_code: u16, reason: &str) -> Self {
        let status = if reason.is_empty() {
            status_code.to_string()
        } else {
            format!("{status_code} {reason}")
        };
        Self {
            status,
            status_code: u32::from(status_code),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// The `Content-Type` header, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}
