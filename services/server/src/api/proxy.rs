//! Proxy entry point.
//!
//! Runs in front of the router. A request carrying `Proxy-Authorization` (or
//! any CONNECT) is a proxy request: the credential's username selects the
//! identity, CONNECT opens a tunnel and everything else is relayed as a
//! single request/response exchange. Other requests fall through to the
//! router untouched.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{CONTENT_TYPE, HOST, PROXY_AUTHORIZATION},
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use burrow_wire::{RequestDescriptor, ResponseDescriptor};
use http_body_util::LengthLimitError;
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::ProxyError;
use crate::relay::{relay_request, run_tunnel};
use crate::state::AppState;

/// Reason phrase of the tunnel-established reply.
const CONNECTION_ESTABLISHED: &[u8] = b"Connection Established";

/// Middleware: divert proxy requests to the relays.
pub async fn proxy_entry(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let is_connect = request.method() == Method::CONNECT;
    if !is_connect && !request.headers().contains_key(PROXY_AUTHORIZATION) {
        // Not a proxy request. Drop any `Proxy` header before routing it.
        request.headers_mut().remove("proxy");
        return next.run(request).await;
    }

    let identity = match proxy_identity(request.headers()) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "Rejected proxy request");
            return e.into_response();
        }
    };

    let span = tracing::info_span!(
        "proxy",
        identity = %identity,
        method = %request.method(),
        uri = %request.uri()
    );

    let result = if is_connect {
        open_tunnel(&state, &identity, request)
            .instrument(span.clone())
            .await
    } else {
        forward_request(&state, &identity, request)
            .instrument(span.clone())
            .await
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "Proxy request failed"));
            e.into_response()
        }
    }
}

/// Extract the routing identity from a Basic `Proxy-Authorization` header.
///
/// The username is the identity. The password is accepted and ignored.
pub fn proxy_identity(headers: &HeaderMap) -> Result<String, ProxyError> {
    let value = headers
        .get(PROXY_AUTHORIZATION)
        .ok_or(ProxyError::AuthMissing("missing Proxy-Authorization header"))?;

    let malformed = ProxyError::AuthMissing("malformed Proxy-Authorization header");
    let value = value.to_str().map_err(|_| malformed)?;

    let (scheme, encoded) = value
        .trim()
        .split_once(' ')
        .ok_or(ProxyError::AuthMissing("malformed Proxy-Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(ProxyError::AuthMissing("unsupported proxy authorization scheme"));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ProxyError::AuthMissing("malformed Proxy-Authorization header"))?;
    let credentials = String::from_utf8(decoded)
        .map_err(|_| ProxyError::AuthMissing("malformed Proxy-Authorization header"))?;

    let username = match credentials.split_once(':') {
        Some((username, _password)) => username,
        None => credentials.as_str(),
    };
    if username.is_empty() {
        return Err(ProxyError::AuthMissing("empty proxy username"));
    }
    Ok(username.to_string())
}

/// Absolute target URL of a non-CONNECT proxy request.
///
/// Absolute-form URIs are used verbatim; origin-form URIs are resolved
/// against the `Host` header.
pub fn target_url(uri: &Uri, headers: &HeaderMap) -> Result<String, ProxyError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .ok_or_else(|| ProxyError::BadTarget("request has no host".to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Ok(format!("http://{host}{path}"))
}

/// `host:port` target of a CONNECT request.
pub fn connect_authority(uri: &Uri) -> Result<String, ProxyError> {
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::BadTarget(format!("CONNECT target {uri} has no authority")))?;
    if authority.port_u16().is_none() {
        return Err(ProxyError::BadTarget(format!(
            "CONNECT target {authority} has no port"
        )));
    }
    Ok(authority.as_str().to_string())
}

async fn forward_request(
    state: &AppState,
    identity: &str,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let url = target_url(&parts.uri, &parts.headers)?;

    let limit = state.codec().max_body_bytes();
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| body_error(e, limit))?;

    let mut descriptor = RequestDescriptor::new(parts.method.as_str(), url).with_body(body);
    for (name, value) in &parts.headers {
        descriptor = descriptor.with_header(name.as_str(), value.as_bytes());
    }

    let pool = state.registry().get_or_create(identity).await;
    let conn = pool.acquire().await?;
    let reply = relay_request(conn, &descriptor, state.codec()).await?;

    into_response(reply)
}

async fn open_tunnel(
    state: &AppState,
    identity: &str,
    mut request: Request,
) -> Result<Response, ProxyError> {
    let authority = connect_authority(request.uri())?;
    let payload = state
        .codec()
        .encode_request(&RequestDescriptor::connect(authority.as_str()))?;

    let pool = state.registry().get_or_create(identity).await;
    let mut conn = pool.acquire().await?;
    let connection_id = conn.id();

    if let Err(e) = conn.send(payload).await {
        conn.finish().await;
        return Err(e);
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let stats = run_tunnel(conn, TokioIo::new(upgraded)).await;
                    info!(
                        connection_id,
                        target = %authority,
                        bytes_to_agent = stats.bytes_to_agent,
                        bytes_from_agent = stats.bytes_from_agent,
                        "Tunnel closed"
                    );
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "CONNECT upgrade failed");
                    conn.finish().await;
                }
            }
        }
        .instrument(Span::current()),
    );

    let mut response = Response::new(Body::empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(CONNECTION_ESTABLISHED));
    Ok(response)
}

/// Build the caller's response from the agent's reply: status, content type
/// and body.
fn into_response(reply: ResponseDescriptor) -> Result<Response, ProxyError> {
    let status = u16::try_from(reply.status_code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProxyError::Decode(format!("invalid status code {}", reply.status_code)))?;
    let content_type = reply
        .header("content-type")
        .and_then(|v| HeaderValue::from_bytes(v).ok());

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(response)
}

fn body_error(e: axum::Error, limit: usize) -> ProxyError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(err) = source {
        if err.is::<LengthLimitError>() {
            return ProxyError::BodyTooLarge { limit };
        }
        source = err.source();
    }
    ProxyError::Transport(format!("failed to read request body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn basic(credentials: &str) -> HeaderMap {
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    #[rstest]
    #[case("alice:secret", "alice")]
    #[case("alice:", "alice")]
    #[case("bob", "bob")]
    #[case("carol:pa:ss", "carol")]
    fn test_proxy_identity_username(#[case] credentials: &str, #[case] expected: &str) {
        assert_eq!(proxy_identity(&basic(credentials)).unwrap(), expected);
    }

    #[rstest]
    #[case::missing(None)]
    #[case::empty_username(Some("Basic OnNlY3JldA=="))]
    #[case::not_base64(Some("Basic %%%"))]
    #[case::wrong_scheme(Some("Bearer abc"))]
    #[case::no_credentials(Some("Basic"))]
    fn test_proxy_identity_rejected(#[case] header: Option<&str>) {
        let mut headers = HeaderMap::new();
        if let Some(value) = header {
            headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        let err = proxy_identity(&headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    }

    #[rstest]
    #[case("http://example.com/a?b=1", None, "http://example.com/a?b=1")]
    #[case("/a?b=1", Some("example.com:8080"), "http://example.com:8080/a?b=1")]
    #[case("/", Some("example.com"), "http://example.com/")]
    fn test_target_url(#[case] uri: &str, #[case] host: Option<&str>, #[case] expected: &str) {
        let uri: Uri = uri.parse().unwrap();
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(HOST, HeaderValue::from_str(host).unwrap());
        }
        assert_eq!(target_url(&uri, &headers).unwrap(), expected);
    }

    #[test]
    fn test_target_url_without_host() {
        let uri: Uri = "/".parse().unwrap();
        let err = target_url(&uri, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[rstest]
    #[case("example.com:443", Some("example.com:443"))]
    #[case("[::1]:8443", Some("[::1]:8443"))]
    #[case("example.com", None)]
    fn test_connect_authority(#[case] uri: &str, #[case] expected: Option<&str>) {
        let uri: Uri = uri.parse().unwrap();
        match expected {
            Some(expected) => assert_eq!(connect_authority(&uri).unwrap(), expected),
            None => assert!(matches!(
                connect_authority(&uri),
                Err(ProxyError::BadTarget(_))
            )),
        }
    }

    #[test]
    fn test_into_response_keeps_content_type_only() {
        let reply = ResponseDescriptor::new(201, "Created")
            .with_header("Content-Type", "text/plain")
            .with_header("X-Extra", "1")
            .with_body("hello");
        let response = into_response(reply).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(response.headers().get("x-extra").is_none());
    }

    #[test]
    fn test_into_response_rejects_bad_status() {
        let mut reply = ResponseDescriptor::new(200, "OK");
        reply.status_code = 1000;
        assert!(matches!(into_response(reply), Err(ProxyError::Decode(_))));
    }
}
