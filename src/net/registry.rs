//! Registry of TLS reloaders, one per TLS listener.

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::net::tls::{TlsError, TlsReloader};

pub struct RegisteredTls {
    pub listener: String,
    pub reloader: Arc<TlsReloader>,
}

/// Filled while listeners are bound, under the write lock; read by reloads.
#[derive(Default)]
pub struct TlsRegistry {
    entries: RwLock<Vec<RegisteredTls>>,
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold this while binding so a reload cannot see a partial registry.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Vec<RegisteredTls>> {
        self.entries.write().await
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Reload every entry, even after a failure, and return all failures.
    pub async fn reload_all(&self) -> Vec<(String, TlsError)> {
        let entries = self.entries.read().await;
        let mut failures = Vec::new();
        for entry in entries.iter() {
            if let Err(e) = entry.reloader.reload().await {
                failures.push((entry.listener.clone(), e));
            }
        }
        failures
    }
}
