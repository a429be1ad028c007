//! Sink server: fans tokens from the auth handler out to every sink.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenEvent;
use crate::observability::metrics;
use crate::resilience::Backoff;
use crate::sink::{Sink, SinkError};

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

pub struct SinkServer {
    exit_after_auth: bool,
}

impl SinkServer {
    pub fn new(exit_after_auth: bool) -> Self {
        Self { exit_after_auth }
    }

    /// Deliver tokens until cancelled or the auth handler goes away.
    ///
    /// With `exit_after_auth` this returns as soon as one token reached every
    /// sink, or with an error if any sink rejected it.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        tokens: &mut mpsc::Receiver<TokenEvent>,
        sinks: &[Arc<dyn Sink>],
    ) -> Result<(), SinkError> {
        tracing::info!(sinks = sinks.len(), "Starting sink server");

        let mut current: Option<TokenEvent> = None;
        let mut pending: Vec<usize> = Vec::new();
        let mut backoff = Backoff::new(RETRY_MIN, RETRY_MAX);
        let mut retry_at: Option<Instant> = None;

        loop {
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::info!("Sink server stopped");
                    return Ok(());
                }
                event = tokens.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Auth handler closed its output, sink server stopping");
                        return Ok(());
                    };
                    tracing::debug!(generation = event.generation, "Received new token");
                    backoff.reset();
                    let all: Vec<usize> = (0..sinks.len()).collect();
                    pending = deliver(&event.token, sinks, &all).await;
                    current = Some(event);
                }
                _ = retry => {
                    if let Some(event) = &current {
                        pending = deliver(&event.token, sinks, &pending).await;
                    }
                }
            }

            if pending.is_empty() {
                retry_at = None;
                if self.exit_after_auth && current.is_some() {
                    tracing::info!("exit_after_auth is set, sink server stopping after first delivery");
                    return Ok(());
                }
            } else {
                if self.exit_after_auth {
                    return Err(SinkError::Delivery {
                        failed: pending.len(),
                    });
                }
                let delay = backoff.next_delay();
                tracing::warn!(failed = pending.len(), retry_in = ?delay, "Retrying failed sink writes");
                retry_at = Some(Instant::now() + delay);
            }
        }
    }
}

/// Write `token` to the sinks at `indexes`, in order. Returns the failures.
async fn deliver(token: &str, sinks: &[Arc<dyn Sink>], indexes: &[usize]) -> Vec<usize> {
    let mut failed = Vec::new();
    for &index in indexes {
        let sink = &sinks[index];
        if let Err(e) = sink.write_token(token).await {
            let name = sink.name();
            tracing::error!(sink = %name, error = %e, "Failed to write token to sink");
            metrics::record_sink_write_failure(&name);
            failed.push(index);
        }
    }
    failed
}

/// Keep consuming tokens after the sink server stopped so the auth handler
/// never blocks on a full channel. Ends with `ctx`.
pub fn spawn_drain(mut tokens: mpsc::Receiver<TokenEvent>, ctx: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                event = tokens.recv() => match event {
                    Some(event) => tracing::debug!(generation = event.generation, "Discarding token, sink server stopped"),
                    None => break,
                },
            }
        }
    });
}

pub async fn close_sinks(sinks: &[Arc<dyn Sink>]) {
    for sink in sinks {
        sink.close().await;
    }
}
