//! Axum handler that feeds listener traffic into the proxier.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;

use crate::http::request::MAX_REQUEST_SIZE;
use crate::http::response::error_response;
use crate::observability::metrics;
use crate::proxy::client::HEADER_TOKEN;
use crate::proxy::{Proxier, SendRequest};
use crate::sink::inmem::TokenSource;

pub const HEADER_CACHE: &str = "x-cache";

/// State shared by the proxy handler of every listener.
#[derive(Clone)]
pub struct ProxyState {
    pub proxier: Arc<dyn Proxier>,
    /// Latest auto-auth token, when the proxy may use it.
    pub auto_auth_token: Option<TokenSource>,
    /// Ignore client tokens and always use the auto-auth token.
    pub force_auto_auth_token: bool,
}

/// Token presented by the client, from `X-Vault-Token` or a bearer header.
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(HEADER_TOKEN)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Decide which token goes upstream.
pub fn select_token(
    headers: &HeaderMap,
    auto_auth: Option<&TokenSource>,
    force: bool,
) -> Option<String> {
    let client = client_token(headers);
    match auto_auth {
        Some(source) if force => source.current().map(|t| t.to_string()),
        Some(source) if client.is_none() => source.current().map(|t| t.to_string()),
        _ => client,
    }
}

pub async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, MAX_REQUEST_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => {
            metrics::record_request(method.as_str(), 400, start);
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            );
        }
    };

    let token = select_token(
        &parts.headers,
        state.auto_auth_token.as_ref(),
        state.force_auto_auth_token,
    );

    tracing::debug!(method = %method, path = %parts.uri.path(), "Proxying request");

    let request = SendRequest {
        token,
        method: method.clone(),
        path_and_query,
        headers: parts.headers,
        body,
    };

    let upstream = match state.proxier.send(request).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status();
            tracing::error!(method = %method, path = %parts.uri.path(), error = %e, "Failed to proxy request");
            metrics::record_request(method.as_str(), status.as_u16(), start);
            return error_response(status, format!("failed to get the response: {}", e));
        }
    };

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    let headers = response.headers_mut();
    for (name, value) in upstream.headers.iter() {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Some(meta) = upstream.cache_meta {
        let hit = if meta.hit { "HIT" } else { "MISS" };
        headers.insert(HEADER_CACHE, HeaderValue::from_static(hit));
        if meta.hit {
            headers.insert(header::AGE, HeaderValue::from(meta.age.as_secs()));
        }
    }

    metrics::record_request(method.as_str(), upstream.status.as_u16(), start);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{CacheMeta, ProxyError, SendResponse};
    use crate::sink::inmem::InmemSink;
    use crate::sink::Sink;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<SendRequest>>,
    }

    #[async_trait]
    impl Proxier for Recorder {
        async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError> {
            self.seen.lock().unwrap().push(request);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(SendResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"{}"),
                cache_meta: Some(CacheMeta {
                    hit: true,
                    age: Duration::from_secs(7),
                }),
            })
        }
    }

    #[test]
    fn test_client_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s.bearer"));
        assert_eq!(client_token(&headers).as_deref(), Some("s.bearer"));
        headers.insert(HEADER_TOKEN, HeaderValue::from_static("s.header"));
        assert_eq!(client_token(&headers).as_deref(), Some("s.header"));
    }

    #[tokio::test]
    async fn test_select_token_prefers_client_unless_forced() {
        let sink = InmemSink::new(None);
        sink.write_token("s.auto").await.unwrap();
        let source = sink.source();

        let mut headers = HeaderMap::new();
        assert_eq!(select_token(&headers, Some(&source), false).as_deref(), Some("s.auto"));

        headers.insert(HEADER_TOKEN, HeaderValue::from_static("s.client"));
        assert_eq!(select_token(&headers, Some(&source), false).as_deref(), Some("s.client"));
        assert_eq!(select_token(&headers, Some(&source), true).as_deref(), Some("s.auto"));
        assert_eq!(select_token(&headers, None, true).as_deref(), Some("s.client"));
    }

    #[tokio::test]
    async fn test_handler_sets_cache_headers() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let state = ProxyState {
            proxier: recorder.clone(),
            auto_auth_token: None,
            force_auto_auth_token: false,
        };
        let request = Request::builder()
            .method("PUT")
            .uri("/v1/secret/foo?x=1")
            .header(HEADER_TOKEN, "s.client")
            .body(Body::from("{\"a\":1}"))
            .unwrap();

        let response = proxy_handler(State(state), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_CACHE], "HIT");
        assert_eq!(response.headers()[header::AGE], "7");

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].path_and_query, "/v1/secret/foo?x=1");
        assert_eq!(seen[0].token.as_deref(), Some("s.client"));
        assert_eq!(&seen[0].body[..], b"{\"a\":1}");
    }
}
