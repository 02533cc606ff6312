//! Outbound HTTP fetch for relayed requests.

use burrow_wire::{RequestDescriptor, ResponseDescriptor};
use bytes::BytesMut;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;

use crate::error::AgentError;

/// Request headers never passed on to the destination.
///
/// `Host` and `Content-Length` are derived from the URL and body. Only
/// `Content-Type` makes it back to the original caller, so the destination
/// is not allowed to pick a content encoding.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "accept-encoding"];

/// Performs the real HTTP call on behalf of the server.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(max_body_bytes: usize) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| AgentError::UpstreamFetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_body_bytes,
        })
    }

    /// Execute `request` and buffer the response.
    pub async fn fetch(&self, request: &RequestDescriptor) -> Result<ResponseDescriptor, AgentError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AgentError::UpstreamFetch(format!("invalid method {:?}", request.method)))?;

        let mut headers = HeaderMap::new();
        for header in &request.headers {
            if SKIPPED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&header.name))
            {
                continue;
            }
            match (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(&header.value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %header.name, "Skipping invalid request header"),
            }
        }

        let mut response = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| AgentError::UpstreamFetch(e.to_string()))?;

        let status = response.status();
        let mut reply = ResponseDescriptor::new(status.as_u16(), status.canonical_reason().unwrap_or(""));
        for (name, value) in response.headers() {
            reply = reply.with_header(name.as_str(), value.as_bytes());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AgentError::UpstreamFetch(e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(AgentError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            url = %request.url,
            status = status.as_u16(),
            body_bytes = body.len(),
            "Fetched"
        );
        Ok(reply.with_body(body.freeze()))
    }
}

/// The reply sent instead of a fetched response when the fetch fails.
pub fn bad_gateway(error: &AgentError) -> ResponseDescriptor {
    ResponseDescriptor::new(502, "Bad Gateway")
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_body(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("hello"),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(1024).unwrap();
        let reply = fetcher
            .fetch(&RequestDescriptor::new("GET", format!("{}/hello", server.uri())))
            .await
            .unwrap();

        assert_eq!(reply.status, "200 OK");
        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.content_type(), Some("text/plain"));
        assert_eq!(&reply.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_fetch_forwards_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-request", "42"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let request = RequestDescriptor::new("POST", format!("{}/submit", server.uri()))
            .with_header("X-Request", "42")
            .with_header("Host", "elsewhere.test")
            .with_body("payload");
        let reply = Fetcher::new(1024).unwrap().fetch(&request).await.unwrap();
        assert_eq!(reply.status_code, 201);
    }

    #[tokio::test]
    async fn test_fetch_enforces_body_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
            .mount(&server)
            .await;

        let result = Fetcher::new(16)
            .unwrap()
            .fetch(&RequestDescriptor::new("GET", server.uri()))
            .await;
        assert!(matches!(result, Err(AgentError::BodyTooLarge { limit: 16 })));
    }

    #[tokio::test]
    async fn test_fetch_failure_becomes_bad_gateway() {
        // Nothing listens on port 9 of the loopback address.
        let result = Fetcher::new(1024)
            .unwrap()
            .fetch(&RequestDescriptor::new("GET", "http://127.0.0.1:9/"))
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, AgentError::UpstreamFetch(_)));

        let reply = bad_gateway(&err);
        assert_eq!(reply.status_code, 502);
        assert_eq!(reply.status, "502 Bad Gateway");
        assert!(String::from_utf8_lossy(&reply.body).starts_with("upstream fetch failed"));
    }
}
