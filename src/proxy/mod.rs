//! API proxy subsystem.
//!
//! # Data Flow
//! ```text
//! Listener request
//!     → handler.rs (pick token, buffer body)
//!     → Proxier::send
//!         → LeaseCache (when configured; serves hits, coalesces misses)
//!         → api_proxy.rs (consistency headers, retries)
//!         → client.rs (reqwest to the upstream)
//!     → handler.rs (X-Cache / Age, copy headers, status, body)
//! ```
//!
//! # Design Decisions
//! - `Proxier` is the seam between the cache and the forwarder
//! - Request bodies are buffered so retries and cache keys can use them
//! - Consistency strings are parsed at startup; unknown values are config errors

pub mod api_proxy;
pub mod client;
pub mod consistency;
pub mod handler;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheError;

pub use api_proxy::ApiProxy;
pub use client::{ClientError, UpstreamClient};
pub use consistency::{ConsistencyPolicy, EnforceConsistency, IndexTracker, WhenInconsistent};

/// A buffered request on its way upstream.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Token to authenticate with upstream, after token selection.
    pub token: Option<String>,
    pub method: Method,
    /// Path plus query, e.g. `/v1/secret/data/foo?version=1`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SendRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            token: None,
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.path_and_query)
    }

    pub fn query(&self) -> Option<&str> {
        self.path_and_query.split_once('?').map(|(_, query)| query)
    }

    /// Namespace the client asked for, normalised to end with `/`.
    pub fn namespace(&self) -> String {
        let ns = self
            .headers
            .get(client::HEADER_NAMESPACE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim_matches('/');
        if ns.is_empty() {
            "root/".to_string()
        } else {
            format!("{}/", ns)
        }
    }
}

/// Cache provenance of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMeta {
    pub hit: bool,
    pub age: Duration,
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct SendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_meta: Option<CacheMeta>,
}

impl SendResponse {
    pub fn is_json(&self) -> bool {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"))
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to reach upstream: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream node has not caught up with the requested index state")]
    Inconsistent {
        headers: HeaderMap,
        body: Bytes,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("request canceled")]
    Canceled,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Client(_) | ProxyError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Inconsistent { .. } => StatusCode::PRECONDITION_FAILED,
            ProxyError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Sends a request upstream, possibly via a cache.
#[async_trait]
pub trait Proxier: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError>;
}
