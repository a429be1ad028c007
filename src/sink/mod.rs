//! Token sinks.
//!
//! # Data Flow
//! ```text
//! AuthHandler output channel
//!     → server.rs (SinkServer, one token at a time)
//!     → file.rs sinks (in config order, atomic write)
//!     → inmem.rs sinks (registered last: static updater, then API proxy)
//! ```
//!
//! # Design Decisions
//! - In-memory sinks come after file sinks, so a consumer reading the proxy's
//!   token can rely on the file sinks already holding it
//! - One failing sink never blocks delivery to the others
//! - Failed writes are retried with backoff until a newer token supersedes them

pub mod file;
pub mod inmem;
pub mod server;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::SinkConfig;

pub use file::FileSink;
pub use inmem::{InmemSink, TokenSource};
pub use server::SinkServer;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unsupported sink type {0:?}")]
    UnsupportedType(String),

    #[error("sink option {0} is not supported")]
    Unsupported(&'static str),

    #[error("invalid sink config: {0}")]
    InvalidConfig(String),

    #[error("failed to write token to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register token with the cache: {0}")]
    Cache(#[from] CacheError),

    #[error("token could not be delivered to {failed} sink(s)")]
    Delivery { failed: usize },
}

/// Destination for freshly acquired tokens.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> String;

    async fn write_token(&self, token: &str) -> Result<(), SinkError>;

    /// Called once when the sink server stops.
    async fn close(&self) {}
}

/// Build the configured file sinks, in config order.
pub fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Arc<dyn Sink>>, SinkError> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(configs.len());
    for config in configs {
        if config.sink_type != "file" {
            return Err(SinkError::UnsupportedType(config.sink_type.clone()));
        }
        if config.dh_type.is_some() || config.dh_path.is_some() {
            return Err(SinkError::Unsupported("dh_type"));
        }
        if config.wrap_ttl.is_some() {
            return Err(SinkError::Unsupported("wrap_ttl"));
        }
        sinks.push(Arc::new(FileSink::from_config(config)?));
    }
    Ok(sinks)
}
