//! Shutdown coordination.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::LeaseCache;

/// Process-wide shutdown request. Triggering is idempotent and the signal
/// is level-triggered, so late subscribers still observe it.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been requested.
    pub async fn recv(&mut self) {
        // A dropped sender can never trigger; treat it as shutdown.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Begins shutdown in the only safe order: the cache stops treating
/// cancellation as an eviction event, then the shared context is cancelled.
#[derive(Clone)]
pub struct ShutdownSequence {
    cache: Option<Arc<LeaseCache>>,
    ctx: CancellationToken,
}

impl ShutdownSequence {
    pub fn new(cache: Option<Arc<LeaseCache>>, ctx: CancellationToken) -> Self {
        Self { cache, ctx }
    }

    pub fn begin(&self) {
        if let Some(cache) = &self.cache {
            cache.set_shutting_down(true);
        }
        self.ctx.cancel();
    }

    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }
}
