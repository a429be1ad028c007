//! Periodically re-checks that tokens with static secret access can still
//! read what they were served.

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, LeaseCache, StaticSecretRef};
use crate::proxy::UpstreamClient;

const CAPABILITIES_PATH: &str = "/v1/sys/capabilities-self";

pub struct CapabilityManager {
    cache: Arc<LeaseCache>,
    client: UpstreamClient,
    interval: Duration,
    stop: CancellationToken,
}

impl CapabilityManager {
    /// The manager stops with `ctx`, or earlier when the cache starts
    /// shutting down.
    pub fn new(
        cache: Arc<LeaseCache>,
        client: UpstreamClient,
        interval: Duration,
        ctx: &CancellationToken,
    ) -> Self {
        let stop = ctx.child_token();
        cache.attach_capability_manager(stop.clone());
        Self {
            cache,
            client,
            interval,
            stop,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    tracing::debug!("Capability manager stopped");
                    return;
                }
                _ = ticker.tick() => self.check_all().await,
            }
        }
    }

    async fn check_all(&self) {
        for (token, secrets) in self.cache.static_secret_tokens() {
            if let Err(e) = self.check_token(&token, &secrets).await {
                tracing::warn!(error = %e, "Failed to refresh token capabilities");
            }
        }
    }

    async fn check_token(&self, token: &str, secrets: &[StaticSecretRef]) -> Result<(), CacheError> {
        let mut by_namespace: BTreeMap<&str, Vec<&StaticSecretRef>> = BTreeMap::new();
        for secret in secrets {
            by_namespace.entry(secret.namespace.as_str()).or_default().push(secret);
        }

        for (namespace, secrets) in by_namespace {
            let paths: Vec<&str> = secrets
                .iter()
                .map(|s| s.request_path.trim_start_matches("/v1/"))
                .collect();
            let ns = Some(namespace.trim_end_matches('/').to_string()).filter(|ns| ns != "root");
            let response = self
                .client
                .with_namespace(ns)
                .request(Method::POST, CAPABILITIES_PATH, Some(token))?
                .json(&json!({ "paths": paths }))
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::FORBIDDEN {
                tracing::info!("Token no longer valid, removing its static secret access");
                for secret in secrets {
                    self.cache.revoke_static_access(token, &secret.id);
                }
                continue;
            }
            if !status.is_success() {
                tracing::warn!(%status, "Unexpected status from capabilities-self");
                continue;
            }

            let body: Value = response.json().await?;
            for secret in secrets {
                let path = secret.request_path.trim_start_matches("/v1/");
                if !can_read(&body, path) {
                    tracing::debug!(path, "Token lost read capability, revoking cached access");
                    self.cache.revoke_static_access(token, &secret.id);
                }
            }
        }
        Ok(())
    }
}

/// Capabilities are returned keyed by path, under `data` or at the top level.
fn can_read(body: &Value, path: &str) -> bool {
    let capabilities = body
        .get("data")
        .and_then(|data| data.get(path))
        .or_else(|| body.get(path))
        .and_then(Value::as_array);
    capabilities.is_some_and(|caps| {
        caps.iter()
            .filter_map(Value::as_str)
            .any(|cap| cap == "read" || cap == "root")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_read() {
        let body = json!({
            "data": {
                "secret/data/a": ["read", "list"],
                "secret/data/b": ["deny"],
                "secret/data/c": ["root"],
            }
        });
        assert!(can_read(&body, "secret/data/a"));
        assert!(!can_read(&body, "secret/data/b"));
        assert!(can_read(&body, "secret/data/c"));
        assert!(!can_read(&body, "secret/data/missing"));
    }

    #[test]
    fn test_can_read_top_level() {
        let body = json!({ "kv/app": ["read"] });
        assert!(can_read(&body, "kv/app"));
    }
}
