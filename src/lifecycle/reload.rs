//! Reload signal and the reload procedure.
//!
//! A reload re-reads every config path, applies the new log level and
//! re-reads every listener certificate. Nothing is committed when the config
//! cannot be loaded. Certificate failures are collected per listener and do
//! not stop the others from reloading.

use arc_swap::ArcSwap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{load_configs, Config, ConfigError};
use crate::lifecycle::systemd;
use crate::net::{TlsError, TlsRegistry};
use crate::observability::{LogHandle, LoggingError};

/// Sending half of the reload signal.
#[derive(Clone)]
pub struct Reload {
    tx: mpsc::UnboundedSender<()>,
}

impl Reload {
    pub fn channel() -> (Reload, ReloadReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Reload { tx }, ReloadReceiver { rx })
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

pub struct ReloadReceiver {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ReloadReceiver {
    /// Wait for the next request; bursts collapse into one reload.
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

#[derive(Debug, Error)]
pub enum ReloadFailure {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("log level: {0}")]
    LogLevel(#[from] LoggingError),

    #[error("tls for listener {listener}: {source}")]
    Tls {
        listener: String,
        #[source]
        source: TlsError,
    },
}

/// Every failure from one reload.
#[derive(Debug)]
pub struct ReloadError {
    pub failures: Vec<ReloadFailure>,
}

impl fmt::Display for ReloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reload failed: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ReloadError {}

pub struct ConfigReloader {
    paths: Vec<PathBuf>,
    config: Arc<ArcSwap<Config>>,
    log: LogHandle,
    tls: Arc<TlsRegistry>,
    reloaded: Option<mpsc::UnboundedSender<Result<(), Arc<ReloadError>>>>,
}

impl ConfigReloader {
    pub fn new(
        paths: Vec<PathBuf>,
        config: Arc<ArcSwap<Config>>,
        log: LogHandle,
        tls: Arc<TlsRegistry>,
    ) -> Self {
        Self {
            paths,
            config,
            log,
            tls,
            reloaded: None,
        }
    }

    /// Report the outcome of every reload on `tx`.
    pub fn with_notifications(
        mut self,
        tx: mpsc::UnboundedSender<Result<(), Arc<ReloadError>>>,
    ) -> Self {
        self.reloaded = Some(tx);
        self
    }

    pub async fn reload(&self) -> Result<(), ReloadError> {
        tracing::info!("Reload triggered");
        systemd::notify(systemd::RELOADING);
        let result = self.apply().await;
        systemd::notify(systemd::READY);

        match &result {
            Ok(()) => tracing::info!("Reload complete"),
            Err(e) => tracing::error!(error = %e, "Reload finished with errors"),
        }
        result
    }

    /// Run `reload` and report the outcome to any listener.
    pub async fn reload_and_notify(&self) {
        let result = self.reload().await.map_err(Arc::new);
        if let Some(tx) = &self.reloaded {
            let _ = tx.send(result);
        }
    }

    async fn apply(&self) -> Result<(), ReloadError> {
        let config = load_configs(&self.paths).map_err(|e| ReloadError {
            failures: vec![ReloadFailure::Config(e)],
        })?;

        let mut failures = Vec::new();
        if let Err(e) = self.log.set_level(config.log_level()) {
            failures.push(ReloadFailure::LogLevel(e));
        } else {
            tracing::info!(level = config.log_level(), "Log level applied");
        }

        for (listener, source) in self.tls.reload_all().await {
            failures.push(ReloadFailure::Tls { listener, source });
        }

        self.config.store(Arc::new(config));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReloadError { failures })
        }
    }
}
