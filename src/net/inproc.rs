//! In-process transport: connections are `tokio::io::duplex` pipes handed
//! from a dialer to the listener over a channel.

use axum::body::Body;
use axum::http::{Request, Response};
use hyper_util::rt::TokioIo;
use std::fmt;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InProcessAddr;

impl fmt::Display for InProcessAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("in-process")
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("in-process listener is closed")]
    Closed,

    #[error("in-process request failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Create a connected listener/dialer pair. `backlog` bounds pending dials.
pub fn in_process_pair(backlog: usize) -> (InProcessListener, InProcessDialer) {
    let (tx, rx) = mpsc::channel(backlog.max(1));
    (InProcessListener { rx }, InProcessDialer { tx })
}

pub struct InProcessListener {
    rx: mpsc::Receiver<DuplexStream>,
}

impl axum::serve::Listener for InProcessListener {
    type Io = DuplexStream;
    type Addr = InProcessAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(stream) => (stream, InProcessAddr),
            // All dialers dropped: nothing will ever connect again.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(InProcessAddr)
    }
}

#[derive(Clone)]
pub struct InProcessDialer {
    tx: mpsc::Sender<DuplexStream>,
}

impl InProcessDialer {
    pub async fn dial(&self) -> Result<DuplexStream, DialError> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.tx.send(server).await.map_err(|_| DialError::Closed)?;
        Ok(client)
    }

    /// Send one HTTP/1.1 request over a fresh connection.
    pub async fn request(&self, request: Request<Body>) -> Result<Response<Body>, DialError> {
        let stream = self.dial().await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "In-process connection closed with error");
            }
        });
        let response = sender.send_request(request).await?;
        Ok(response.map(Body::new))
    }
}
