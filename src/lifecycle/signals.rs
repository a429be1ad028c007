//! OS signal handling.
//!
//! SIGHUP raises the reload signal; SIGINT and SIGTERM raise shutdown.
//! Signals are only forwarded here; acting on them is the orchestrator's job.

use tokio_util::sync::CancellationToken;

use crate::lifecycle::reload::Reload;
use crate::lifecycle::shutdown::Shutdown;

/// Forward OS signals until `ctx` is cancelled.
#[cfg(unix)]
pub fn spawn_signal_forwarder(shutdown: Shutdown, reload: Reload, ctx: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut hup, mut int, mut term) = match (
            signal(SignalKind::hangup()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(hup), Ok(int), Ok(term)) => (hup, int, term),
            _ => {
                tracing::error!("Failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = hup.recv() => {
                    tracing::info!("SIGHUP received");
                    reload.trigger();
                }
                _ = int.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    shutdown.trigger();
                }
                _ = term.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    shutdown.trigger();
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_signal_forwarder(shutdown: Shutdown, _reload: Reload, ctx: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Failed to listen for ctrl-c");
                        return;
                    }
                    tracing::info!("Interrupt received, shutting down");
                    shutdown.trigger();
                }
            }
        }
    });
}
