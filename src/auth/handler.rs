//! Authentication loop: logs in, publishes tokens, schedules re-auth.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, AuthMethod, AuthResponse};
use crate::config::AutoAuthConfig;
use crate::observability::metrics;
use crate::resilience::Backoff;

/// A token handed to the sink server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEvent {
    pub token: String,
    /// Increments with every successful login.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct AuthHandlerConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub exit_on_error: bool,
    pub enable_reauth_on_new_credentials: bool,
}

impl AuthHandlerConfig {
    pub fn from_config(config: &AutoAuthConfig) -> Self {
        Self {
            min_backoff: config.method.min_backoff,
            max_backoff: config.method.max_backoff,
            exit_on_error: config.method.exit_on_error,
            enable_reauth_on_new_credentials: config.enable_reauth_on_new_credentials,
        }
    }
}

impl Default for AuthHandlerConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            exit_on_error: false,
            enable_reauth_on_new_credentials: false,
        }
    }
}

pub struct AuthHandler {
    config: AuthHandlerConfig,
    output: mpsc::Sender<TokenEvent>,
}

impl AuthHandler {
    /// Create the handler and the receiving end of its token channel.
    pub fn new(config: AuthHandlerConfig) -> (Self, mpsc::Receiver<TokenEvent>) {
        let (output, rx) = mpsc::channel(1);
        (Self { config, output }, rx)
    }

    /// Run until `ctx` is cancelled.
    ///
    /// Returns an error only when `exit_on_error` is set and a login failed.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        method: Arc<dyn AuthMethod>,
    ) -> Result<(), AuthError> {
        tracing::info!(method = method.name(), "Starting auth handler");

        let mut backoff = Backoff::new(self.config.min_backoff, self.config.max_backoff);
        let mut generation = 0u64;
        let credentials = if self.config.enable_reauth_on_new_credentials {
            method.new_credentials()
        } else {
            None
        };

        loop {
            let result = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                result = method.authenticate() => result,
            };

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    metrics::record_auth(false);
                    if self.config.exit_on_error {
                        tracing::error!(method = method.name(), error = %e, "Authentication failed and exit_on_error is set");
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    tracing::error!(
                        method = method.name(),
                        error = %e,
                        backoff = ?delay,
                        "Authentication failed, backing off"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            metrics::record_auth(true);
            backoff.reset();
            generation += 1;
            tracing::info!(
                method = method.name(),
                generation,
                ttl = ?response.lease_duration,
                "Authentication successful, sending token to sinks"
            );

            let event = TokenEvent {
                token: response.token.clone(),
                generation,
            };
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                sent = self.output.send(event) => {
                    if sent.is_err() {
                        tracing::debug!("Token consumer gone, auth handler stopping");
                        return Ok(());
                    }
                }
            }

            let reauth_after = reauth_delay(&response);
            if let Some(delay) = reauth_after {
                tracing::debug!(reauth_in = ?delay, "Scheduled re-authentication");
            }
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = wait_for(reauth_after) => {
                    tracing::info!(method = method.name(), "Token nearing expiry, re-authenticating");
                }
                _ = credentials_changed(credentials.clone()) => {
                    tracing::info!(method = method.name(), "New credentials detected, re-authenticating");
                }
            }
        }
    }
}

/// Two thirds of the TTL, or never when the TTL is unknown.
pub fn reauth_delay(response: &AuthResponse) -> Option<Duration> {
    if response.lease_duration.is_zero() {
        return None;
    }
    Some((response.lease_duration * 2 / 3).max(Duration::from_secs(1)))
}

async fn wait_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn credentials_changed(notify: Option<Arc<Notify>>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedMethod {
        calls: AtomicU32,
        fail_first: u32,
        fail_always: bool,
        lease: Duration,
        notify: Arc<Notify>,
    }

    impl ScriptedMethod {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                fail_always: false,
                lease: Duration::ZERO,
                notify: Arc::new(Notify::new()),
            }
        }
    }

    #[async_trait]
    impl AuthMethod for ScriptedMethod {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn authenticate(&self) -> Result<AuthResponse, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_always || call < self.fail_first {
                return Err(AuthError::MissingAuth);
            }
            Ok(AuthResponse {
                token: format!("s.token-{}", call),
                lease_duration: self.lease,
                renewable: true,
            })
        }

        fn new_credentials(&self) -> Option<Arc<Notify>> {
            Some(self.notify.clone())
        }
    }

    fn fast_config() -> AuthHandlerConfig {
        AuthHandlerConfig {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_reauth_delay() {
        let response = AuthResponse {
            token: "t".into(),
            lease_duration: Duration::from_secs(3600),
            renewable: true,
        };
        assert_eq!(reauth_delay(&response), Some(Duration::from_secs(2400)));
        let unknown = AuthResponse {
            lease_duration: Duration::ZERO,
            ..response
        };
        assert_eq!(reauth_delay(&unknown), None);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (handler, mut rx) = AuthHandler::new(fast_config());
        let method = Arc::new(ScriptedMethod::new(2));
        let ctx = CancellationToken::new();
        let task = {
            let ctx = ctx.clone();
            let method = method.clone();
            tokio::spawn(async move { handler.run(ctx, method).await })
        };

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.token, "s.token-2");
        assert_eq!(event.generation, 1);

        ctx.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exit_on_error_is_fatal() {
        let config = AuthHandlerConfig {
            exit_on_error: true,
            ..fast_config()
        };
        let (handler, _rx) = AuthHandler::new(config);
        let mut method = ScriptedMethod::new(0);
        method.fail_always = true;

        let result = handler.run(CancellationToken::new(), Arc::new(method)).await;
        assert!(matches!(result, Err(AuthError::MissingAuth)));
    }

    #[tokio::test]
    async fn test_new_credentials_trigger_reauth() {
        let config = AuthHandlerConfig {
            enable_reauth_on_new_credentials: true,
            ..fast_config()
        };
        let (handler, mut rx) = AuthHandler::new(config);
        let method = Arc::new(ScriptedMethod::new(0));
        let ctx = CancellationToken::new();
        let task = {
            let ctx = ctx.clone();
            let method = method.clone();
            tokio::spawn(async move { handler.run(ctx, method).await })
        };

        let first = rx.recv().await.unwrap();
        method.notify.notify_one();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);

        ctx.cancel();
        task.await.unwrap().unwrap();
    }
}
