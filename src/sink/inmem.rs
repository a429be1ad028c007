//! In-memory sink: publishes the latest token to in-process consumers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::LeaseCache;
use crate::sink::{Sink, SinkError};

pub struct InmemSink {
    tx: watch::Sender<Option<Arc<str>>>,
    cache: Option<Arc<LeaseCache>>,
}

impl InmemSink {
    /// With a cache, every token written is registered as a managed token.
    pub fn new(cache: Option<Arc<LeaseCache>>) -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, cache }
    }

    pub fn source(&self) -> TokenSource {
        TokenSource {
            rx: self.tx.subscribe(),
        }
    }
}

#[async_trait]
impl Sink for InmemSink {
    fn name(&self) -> String {
        "inmem".to_string()
    }

    async fn write_token(&self, token: &str) -> Result<(), SinkError> {
        if let Some(cache) = &self.cache {
            cache.register_auto_auth_token(token)?;
        }
        self.tx.send_replace(Some(Arc::from(token)));
        Ok(())
    }
}

/// Read side of an [`InmemSink`].
#[derive(Clone)]
pub struct TokenSource {
    rx: watch::Receiver<Option<Arc<str>>>,
}

impl TokenSource {
    pub fn current(&self) -> Option<Arc<str>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next token. Returns `None` once the sink is gone.
    pub async fn next_token(&mut self) -> Option<Arc<str>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(token) = self.rx.borrow_and_update().clone() {
                return Some(token);
            }
        }
    }
}
