//! Handlers for the proxy's own API under `/proxy/v1/`.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::cache::{CacheClearRequest, CacheError};
use crate::http::response::error_response;
use crate::http::server::RouterState;

pub const PATH_METRICS: &str = "/proxy/v1/metrics";
pub const PATH_CACHE_CLEAR: &str = "/proxy/v1/cache-clear";
pub const PATH_QUIT: &str = "/proxy/v1/quit";

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    format: Option<String>,
}

pub async fn metrics_handler(
    State(state): State<RouterState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    match query.format.as_deref() {
        None | Some("") | Some("prometheus") => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            state.metrics.render(),
        )
            .into_response(),
        Some(other) => error_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported metrics format {:?}", other),
        ),
    }
}

pub async fn cache_clear_handler(
    State(state): State<RouterState>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST && method != Method::PUT {
        return StatusCode::OK.into_response();
    }
    let Some(cache) = &state.cache else {
        return StatusCode::OK.into_response();
    };
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "failed to parse cache clear request: empty body");
    }
    let request: CacheClearRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to parse cache clear request: {}", e),
            )
        }
    };

    match cache.clear(&request) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e @ (CacheError::InvalidClearType(_) | CacheError::MissingClearType)) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "Cache clear failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn quit_handler(
    State(state): State<RouterState>,
    method: Method,
) -> Response {
    if !state.quit_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    tracing::info!("Received quit request, shutting down");
    state.shutdown.trigger();
    StatusCode::OK.into_response()
}
