//! Forwarding proxier: sends buffered requests to the upstream server.

use async_trait::async_trait;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use reqwest::RequestBuilder;
use std::time::Duration;

use crate::proxy::client::{HEADER_NAMESPACE, HEADER_TOKEN, USER_AGENT};
use crate::proxy::consistency::{ConsistencyPolicy, IndexTracker, WhenInconsistent};
use crate::proxy::{Proxier, ProxyError, SendRequest, SendResponse, UpstreamClient};
use crate::resilience::calculate_backoff;

const RETRY_WAIT_MIN: Duration = Duration::from_millis(1000);
const RETRY_WAIT_MAX: Duration = Duration::from_millis(1500);

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED
}

/// `parent/` + `child` → `parent/child`.
pub fn join_namespace(configured: &str, requested: &str) -> String {
    let configured = configured.trim_matches('/');
    let requested = requested.trim_matches('/');
    match (configured.is_empty(), requested.is_empty()) {
        (_, true) => configured.to_string(),
        (true, false) => requested.to_string(),
        (false, false) => format!("{}/{}", configured, requested),
    }
}

/// Forwards requests upstream, applying the consistency policy.
pub struct ApiProxy {
    client: UpstreamClient,
    policy: ConsistencyPolicy,
    index: IndexTracker,
    prepend_namespace: bool,
}

impl ApiProxy {
    pub fn new(client: UpstreamClient, policy: ConsistencyPolicy, prepend_namespace: bool) -> Self {
        Self {
            client,
            policy,
            index: IndexTracker::new(),
            prepend_namespace,
        }
    }

    pub fn policy(&self) -> ConsistencyPolicy {
        self.policy
    }

    fn build(&self, request: &SendRequest) -> Result<RequestBuilder, ProxyError> {
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name)
                || name == header::HOST
                || name == header::CONTENT_LENGTH
                || name == header::USER_AGENT
                || name.as_str() == HEADER_TOKEN
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(token) = request.token.as_deref().filter(|t| !t.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(HEADER_TOKEN, value);
            }
        }

        let user_agent = match request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
        {
            Some(client_agent) => format!("{}; {}", USER_AGENT, client_agent),
            None => USER_AGENT.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert(header::USER_AGENT, value);
        }

        if self.prepend_namespace {
            if let Some(configured) = self.client.namespace() {
                let requested = request
                    .headers
                    .get(HEADER_NAMESPACE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if let Ok(value) = HeaderValue::from_str(&join_namespace(configured, requested)) {
                    headers.insert(HEADER_NAMESPACE, value);
                }
            }
        }

        self.index.apply(&self.policy, &mut headers);

        Ok(self
            .client
            .forward(request.method.clone(), &request.path_and_query)?
            .headers(headers)
            .body(request.body.clone()))
    }
}

#[async_trait]
impl Proxier for ApiProxy {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, ProxyError> {
        let max_retries = self.client.max_retries();
        let mut attempt = 0u32;

        loop {
            let outcome = self.build(&request)?.send().await;
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();

                    if self.policy.enforced() {
                        if status == StatusCode::PRECONDITION_FAILED {
                            if self.policy.when_inconsistent == WhenInconsistent::Retry
                                && attempt < max_retries
                            {
                                attempt += 1;
                                let delay = calculate_backoff(attempt, RETRY_WAIT_MIN, RETRY_WAIT_MAX);
                                tracing::debug!(
                                    path = %request.path(),
                                    attempt,
                                    delay = ?delay,
                                    "Upstream node behind requested index, retrying"
                                );
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            let body = response.bytes().await?;
                            return Err(ProxyError::Inconsistent { headers, body });
                        }
                        self.index.observe(&headers);
                    }

                    if is_retryable_status(status) && attempt < max_retries {
                        attempt += 1;
                        let delay = calculate_backoff(attempt, RETRY_WAIT_MIN, RETRY_WAIT_MAX);
                        tracing::warn!(
                            path = %request.path(),
                            status = %status,
                            attempt,
                            delay = ?delay,
                            "Upstream returned server error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body = response.bytes().await?;
                    return Ok(SendResponse {
                        status,
                        headers,
                        body,
                        cache_meta: None,
                    });
                }
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < max_retries => {
                    attempt += 1;
                    let delay = calculate_backoff(attempt, RETRY_WAIT_MIN, RETRY_WAIT_MAX);
                    tracing::warn!(
                        path = %request.path(),
                        error = %e,
                        attempt,
                        delay = ?delay,
                        "Upstream unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
