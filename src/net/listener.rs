//! Listener binding and serving.
//!
//! # Responsibilities
//! - Bind tcp, unix and in-process endpoints from config
//! - Load TLS material for tcp listeners that enable it
//! - Serve a router until the listener's token is cancelled
//!
//! Binding is separate from serving so every listener, and every TLS
//! reloader, exists before the first request is accepted.

use axum::Router;
use axum_server::Handle;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ListenerConfig, ListenerType};
use crate::net::inproc::{in_process_pair, InProcessDialer, InProcessListener};
use crate::net::tls::{TlsError, TlsReloader};

const IN_PROCESS_BACKLOG: usize = 128;
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener {address}: {source}")]
    Tls {
        address: String,
        #[source]
        source: TlsError,
    },

    #[error("listener {0}: tls_cert_file and tls_key_file are required")]
    MissingTlsFiles(String),

    #[error("unix listeners are not supported on this platform")]
    UnixUnsupported,
}

/// Where a listener accepts connections, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddress {
    Tcp { addr: SocketAddr, tls: bool },
    Unix(PathBuf),
    InProcess,
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddress::Tcp { addr, tls: true } => write!(f, "https://{}", addr),
            ListenerAddress::Tcp { addr, tls: false } => write!(f, "http://{}", addr),
            ListenerAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenerAddress::InProcess => f.write_str("http://in-process"),
        }
    }
}

pub enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
    InProcess(InProcessListener),
    /// Accepts nothing and fails once `after` elapses.
    #[cfg(test)]
    Failing { after: Duration },
}

/// A bound listener and everything needed to serve it.
pub struct ListenerBundle {
    pub listener: BoundListener,
    pub tls: Option<Arc<TlsReloader>>,
    pub address: ListenerAddress,
    /// Set for in-process listeners.
    pub dialer: Option<InProcessDialer>,
}

pub async fn start_listener(config: &ListenerConfig) -> Result<ListenerBundle, ListenerError> {
    match config.listener_type {
        ListenerType::Tcp => bind_tcp(config).await,
        ListenerType::Unix => bind_unix(Path::new(&config.address)),
        ListenerType::InProcess => {
            let (listener, dialer) = in_process_pair(IN_PROCESS_BACKLOG);
            Ok(ListenerBundle {
                listener: BoundListener::InProcess(listener),
                tls: None,
                address: ListenerAddress::InProcess,
                dialer: Some(dialer),
            })
        }
    }
}

async fn bind_tcp(config: &ListenerConfig) -> Result<ListenerBundle, ListenerError> {
    let bind_error = |source| ListenerError::Bind {
        address: config.address.clone(),
        source,
    };

    let tls = if config.tls_enabled() {
        let (Some(cert), Some(key)) = (&config.tls_cert_file, &config.tls_key_file) else {
            return Err(ListenerError::MissingTlsFiles(config.address.clone()));
        };
        let reloader = TlsReloader::load(cert, key)
            .await
            .map_err(|source| ListenerError::Tls {
                address: config.address.clone(),
                source,
            })?;
        Some(Arc::new(reloader))
    } else {
        None
    };

    let listener = std::net::TcpListener::bind(&config.address).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    let addr = listener.local_addr().map_err(bind_error)?;

    tracing::debug!(address = %addr, tls = tls.is_some(), "Listener bound");
    Ok(ListenerBundle {
        listener: BoundListener::Tcp(listener),
        address: ListenerAddress::Tcp {
            addr,
            tls: tls.is_some(),
        },
        tls,
        dialer: None,
    })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<ListenerBundle, ListenerError> {
    let bind_error = |source| ListenerError::Bind {
        address: path.display().to_string(),
        source,
    };
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_error(e)),
    }
    let listener = std::os::unix::net::UnixListener::bind(path).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(ListenerBundle {
        listener: BoundListener::Unix(listener),
        tls: None,
        address: ListenerAddress::Unix(path.to_path_buf()),
        dialer: None,
    })
}

#[cfg(not(unix))]
fn bind_unix(_path: &Path) -> Result<ListenerBundle, ListenerError> {
    Err(ListenerError::UnixUnsupported)
}

/// Serve `router` until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    listener: BoundListener,
    tls: Option<Arc<TlsReloader>>,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    match (listener, tls) {
        (BoundListener::Tcp(listener), Some(tls)) => {
            let handle = Handle::new();
            let watcher = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                watcher.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
            });
            axum_server::from_tcp_rustls(listener, tls.config())
                .handle(handle)
                .serve(router.into_make_service())
                .await
        }
        (BoundListener::Tcp(listener), None) => {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
        #[cfg(unix)]
        (BoundListener::Unix(listener), _) => {
            let listener = tokio::net::UnixListener::from_std(listener)?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
        (BoundListener::InProcess(listener), _) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
        #[cfg(test)]
        (BoundListener::Failing { after }, _) => {
            tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                _ = tokio::time::sleep(after) => Err(std::io::Error::other("accept failed")),
            }
        }
    }
}
