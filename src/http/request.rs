//! Request handling shared by all listeners.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) and echo it on the response
//! - Enforce the request body size limit
//! - Reject proxied requests missing `X-Vault-Request` when a listener asks for it
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The header check guards the proxy route only, never metrics or proxy APIs

use axum::extract::Request;
use axum::http::{HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::http::response::error_response;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_VAULT_REQUEST: &str = "x-vault-request";

/// Largest request body accepted from clients.
pub const MAX_REQUEST_SIZE: usize = 32 * 1024 * 1024;

pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

/// Middleware rejecting requests without `X-Vault-Request: true`.
pub async fn require_request_header(request: Request, next: Next) -> Response {
    let present = request
        .headers()
        .get(X_VAULT_REQUEST)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if !present {
        tracing::debug!(path = %request.uri().path(), "Rejecting request without X-Vault-Request header");
        return error_response(StatusCode::PRECONDITION_FAILED, "missing 'X-Vault-Request' header");
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(require_request_header))
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_header_present_passes() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Vault-Request", "true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
