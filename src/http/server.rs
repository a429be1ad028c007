//! Per-listener router.
//!
//! # Routes
//! - `GET /proxy/v1/metrics`: always
//! - `/proxy/v1/cache-clear`, `/proxy/v1/quit`: unless the listener is metrics-only
//! - everything else: the proxy handler, unless the listener is metrics-only
//!
//! # Design Decisions
//! - One router per listener so role and header requirements stay local
//! - `X-Vault-Request` enforcement wraps the proxy fallback only

use axum::routing::{any, get};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::cache::LeaseCache;
use crate::config::{ListenerConfig, ListenerRole};
use crate::http::proxy_api::{
    cache_clear_handler, metrics_handler, quit_handler, PATH_CACHE_CLEAR, PATH_METRICS, PATH_QUIT,
};
use crate::http::request::{
    propagate_request_id_layer, require_request_header, set_request_id_layer, MAX_REQUEST_SIZE,
};
use crate::lifecycle::Shutdown;
use crate::proxy::handler::{proxy_handler, ProxyState};

/// State injected into the proxy API handlers.
#[derive(Clone)]
pub struct RouterState {
    pub proxy: ProxyState,
    pub cache: Option<Arc<LeaseCache>>,
    pub shutdown: Shutdown,
    pub metrics: PrometheusHandle,
    pub quit_enabled: bool,
}

pub fn build_router(listener: &ListenerConfig, state: RouterState) -> Router {
    let state = RouterState {
        quit_enabled: listener.quit_enabled(),
        ..state
    };

    let mut router = Router::new().route(PATH_METRICS, get(metrics_handler));

    if listener.role != ListenerRole::MetricsOnly {
        let mut proxy = Router::new()
            .fallback(proxy_handler)
            .with_state(state.proxy.clone());
        if listener.require_request_header {
            proxy = proxy.layer(axum::middleware::from_fn(require_request_header));
        }
        router = router
            .route(PATH_CACHE_CLEAR, any(cache_clear_handler))
            .route(PATH_QUIT, any(quit_handler))
            .fallback_service(proxy);
    }

    router
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_SIZE))
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(set_request_id_layer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Proxier, ProxyError, SendRequest, SendResponse};
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request, StatusCode};
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl Proxier for Echo {
        async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError> {
            Ok(SendResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from(request.path_and_query),
                cache_meta: None,
            })
        }
    }

    fn state(shutdown: Shutdown) -> RouterState {
        RouterState {
            proxy: ProxyState {
                proxier: Arc::new(Echo),
                auto_auth_token: None,
                force_auto_auth_token: false,
            },
            cache: None,
            shutdown,
            metrics: crate::observability::metrics::install(),
            quit_enabled: false,
        }
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_fallback_proxies() {
        let router = build_router(&ListenerConfig::tcp("127.0.0.1:0"), state(Shutdown::new()));
        let (status, body) = call(router, "GET", "/v1/secret/foo").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "/v1/secret/foo");
    }

    #[tokio::test]
    async fn test_metrics_only_listener() {
        let mut listener = ListenerConfig::tcp("127.0.0.1:0");
        listener.role = ListenerRole::MetricsOnly;
        let router = build_router(&listener, state(Shutdown::new()));

        let (status, _) = call(router.clone(), "GET", "/proxy/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router.clone(), "GET", "/v1/secret/foo").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(router, "POST", "/proxy/v1/quit").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_rejects_unknown_format() {
        let router = build_router(&ListenerConfig::tcp("127.0.0.1:0"), state(Shutdown::new()));
        let (status, _) = call(router, "GET", "/proxy/v1/metrics?format=json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quit_requires_enablement_and_post() {
        let shutdown = Shutdown::new();
        let disabled = build_router(&ListenerConfig::tcp("127.0.0.1:0"), state(shutdown.clone()));
        let (status, _) = call(disabled, "POST", "/proxy/v1/quit").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut listener = ListenerConfig::tcp("127.0.0.1:0");
        listener.proxy_api = Some(crate::config::ProxyApiConfig { enable_quit: true });
        let enabled = build_router(&listener, state(shutdown.clone()));
        let (status, _) = call(enabled.clone(), "GET", "/proxy/v1/quit").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(!shutdown.is_triggered());

        let (status, _) = call(enabled, "POST", "/proxy/v1/quit").await;
        assert_eq!(status, StatusCode::OK);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_request_header_guards_proxy_only() {
        let mut listener = ListenerConfig::tcp("127.0.0.1:0");
        listener.require_request_header = true;
        let router = build_router(&listener, state(Shutdown::new()));

        let (status, _) = call(router.clone(), "GET", "/v1/secret/foo").await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        let (status, _) = call(router, "GET", "/proxy/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_clear_without_cache_is_ok() {
        let router = build_router(&ListenerConfig::tcp("127.0.0.1:0"), state(Shutdown::new()));
        let (status, _) = call(router, "POST", "/proxy/v1/cache-clear").await;
        assert_eq!(status, StatusCode::OK);
    }
}
