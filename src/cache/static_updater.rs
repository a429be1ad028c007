//! Keeps cached static secrets fresh.
//!
//! Subscribes to the upstream KV event stream with the auto-auth token and
//! refetches a secret whenever an event reports it modified. Every
//! (re)connect starts with a full refresh so events missed while
//! disconnected do not leave stale copies behind.

use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

use crate::cache::lease_cache::static_index_id;
use crate::cache::{CacheError, CachedResponse, LeaseCache, StaticSecretRef};
use crate::proxy::client::{HEADER_NAMESPACE, HEADER_TOKEN};
use crate::proxy::UpstreamClient;
use crate::resilience::Backoff;
use crate::sink::inmem::TokenSource;

const EVENTS_PATH: &str = "/v1/sys/events/subscribe/kv*";

#[derive(Debug, Default, Deserialize)]
struct EventEnvelope {
    #[serde(default)]
    data: EventData,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    event: Event,
}

#[derive(Debug, Default, Deserialize)]
struct Event {
    #[serde(default)]
    metadata: EventMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct EventMetadata {
    #[serde(default)]
    path: String,
    #[serde(default)]
    data_path: String,
    #[serde(default)]
    modified: String,
}

/// Namespace and path of the secret a KV event refers to, if it changed data.
fn modified_secret(text: &str) -> Option<(String, String)> {
    let envelope: EventEnvelope = serde_json::from_str(text).ok()?;
    let metadata = envelope.data.event.metadata;
    if metadata.modified != "true" {
        return None;
    }
    let path = if metadata.data_path.is_empty() {
        metadata.path
    } else {
        metadata.data_path
    };
    if path.is_empty() {
        return None;
    }
    let ns = envelope.data.namespace.trim_matches('/');
    let namespace = if ns.is_empty() {
        "root/".to_string()
    } else {
        format!("{}/", ns)
    };
    Some((namespace, path))
}

pub struct StaticSecretUpdater {
    cache: Arc<LeaseCache>,
    client: UpstreamClient,
    tokens: TokenSource,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl StaticSecretUpdater {
    pub fn new(cache: Arc<LeaseCache>, client: UpstreamClient, tokens: TokenSource) -> Self {
        Self {
            cache,
            client,
            tokens,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Run until `ctx` is cancelled.
    pub async fn run(self, ctx: CancellationToken) -> Result<(), CacheError> {
        let Self {
            cache,
            client,
            mut tokens,
            min_backoff,
            max_backoff,
        } = self;
        let worker = Worker { cache, client };

        let mut token = match tokens.current() {
            Some(token) => token,
            None => {
                tracing::debug!("Static secret updater waiting for auto-auth token");
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    token = tokens.next_token() => match token {
                        Some(token) => token,
                        None => return Ok(()),
                    },
                }
            }
        };

        let mut backoff = Backoff::new(min_backoff, max_backoff);
        loop {
            worker.refresh_all(&token).await;

            let outcome = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                next = tokens.next_token() => match next {
                    Some(next) => {
                        tracing::info!("New auto-auth token, reconnecting event stream");
                        token = next;
                        backoff.reset();
                        continue;
                    }
                    None => return Ok(()),
                },
                outcome = worker.stream_events(&token, &mut backoff) => outcome,
            };

            let delay = backoff.next_delay();
            match outcome {
                Ok(()) => tracing::warn!(backoff = ?delay, "Event stream closed, reconnecting"),
                Err(e) => tracing::warn!(error = %e, backoff = ?delay, "Event stream failed, reconnecting"),
            }
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

struct Worker {
    cache: Arc<LeaseCache>,
    client: UpstreamClient,
}

impl Worker {
    async fn refresh_all(&self, token: &str) {
        let secrets = self.cache.static_entries();
        if secrets.is_empty() {
            return;
        }
        tracing::debug!(count = secrets.len(), "Refreshing static secrets");
        for secret in &secrets {
            if let Err(e) = self.refresh(token, secret).await {
                tracing::warn!(path = %secret.request_path, error = %e, "Failed to refresh static secret");
            }
        }
    }

    async fn refresh(&self, token: &str, secret: &StaticSecretRef) -> Result<(), CacheError> {
        let namespace = Some(secret.namespace.trim_end_matches('/').to_string())
            .filter(|ns| ns != "root");
        let response = self
            .client
            .with_namespace(namespace)
            .request(Method::GET, &secret.request_path, Some(token))?
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
            tracing::debug!(path = %secret.request_path, %status, "Static secret gone, evicting");
            self.cache.evict(&secret.id);
            return Ok(());
        }
        if !status.is_success() {
            tracing::warn!(path = %secret.request_path, %status, "Unexpected status refreshing static secret");
            return Ok(());
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;
        self.cache.update_static_secret(
            &secret.id,
            CachedResponse {
                status: status.as_u16(),
                headers,
                body,
            },
        );
        Ok(())
    }

    /// Read events until the stream ends.
    async fn stream_events(&self, token: &str, backoff: &mut Backoff) -> Result<(), CacheError> {
        let mut url = self.client.url(EVENTS_PATH)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| CacheError::EventStream(format!("cannot use {} for events", url)))?;
        url.set_query(Some("json=true"));

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| CacheError::EventStream(e.to_string()))?;
        let token_value = HeaderValue::from_str(token)
            .map_err(|_| CacheError::EventStream("token is not a valid header value".into()))?;
        request.headers_mut().insert(HEADER_TOKEN, token_value);
        if let Some(namespace) = self.client.namespace() {
            if let Ok(value) = HeaderValue::from_str(namespace) {
                request.headers_mut().insert(HEADER_NAMESPACE, value);
            }
        }

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| CacheError::EventStream(e.to_string()))?;
        tracing::info!(url = %url, "Subscribed to KV events");
        backoff.reset();

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| CacheError::EventStream(e.to_string()))?;
            if message.is_close() {
                break;
            }
            let Ok(text) = message.to_text() else {
                continue;
            };
            let Some((namespace, path)) = modified_secret(text) else {
                continue;
            };
            let id = static_index_id(&namespace, &path);
            let Some(entry) = self.cache.get(&id) else {
                continue;
            };
            let secret = StaticSecretRef {
                id,
                namespace: entry.namespace,
                request_path: entry.request_path,
            };
            tracing::debug!(path = %secret.request_path, "KV event, refreshing static secret");
            if let Err(e) = self.refresh(token, &secret).await {
                tracing::warn!(path = %secret.request_path, error = %e, "Failed to refresh static secret");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_event_yields_data_path() {
        let event = r#"{"data":{"namespace":"","event":{"metadata":{
            "path":"secret/metadata/foo","data_path":"secret/data/foo","modified":"true"}}}}"#;
        assert_eq!(
            modified_secret(event),
            Some(("root/".to_string(), "secret/data/foo".to_string()))
        );
    }

    #[test]
    fn test_unmodified_event_ignored() {
        let event = r#"{"data":{"event":{"metadata":{"path":"secret/foo","modified":"false"}}}}"#;
        assert_eq!(modified_secret(event), None);
        assert_eq!(modified_secret("not json"), None);
    }

    #[test]
    fn test_event_path_matches_cached_request_path() {
        let event = r#"{"data":{"namespace":"team/","event":{"metadata":{"path":"kv/app","modified":"true"}}}}"#;
        let (namespace, path) = modified_secret(event).unwrap();
        assert_eq!(
            static_index_id(&namespace, &path),
            static_index_id("team/", "/v1/kv/app")
        );
    }
}
