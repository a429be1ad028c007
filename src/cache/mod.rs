//! Lease cache subsystem.
//!
//! # Data Flow
//! ```text
//! proxy handler → LeaseCache (Proxier)
//!     hit  → cached response, X-Cache: HIT
//!     miss → per-request lock → ApiProxy → cache 2xx renewable responses
//!
//! static_updater.rs: event stream → refresh static secrets in place
//! capability.rs:     periodic capabilities-self → drop revoked access
//! persist.rs:        snapshot after each mutation, restore at startup
//! ```
//!
//! # Design Decisions
//! - Entries live in a `DashMap` keyed by request hash
//! - Concurrent identical requests share one upstream call via per-key locks
//! - Shutdown keeps entries; any other cancellation of the base context evicts them

pub mod capability;
pub mod lease_cache;
pub mod persist;
pub mod static_updater;

use std::path::PathBuf;
use thiserror::Error;

use crate::proxy::ClientError;

pub use capability::CapabilityManager;
pub use lease_cache::{
    CacheClearRequest, CacheEntry, CachedResponse, EntryKind, LeaseCache, LeaseCacheConfig,
    StaticSecretRef,
};
pub use persist::Persistence;
pub use static_updater::StaticSecretUpdater;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache persistence failed for {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize cache data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid type provided: {0}")]
    InvalidClearType(String),

    #[error("type must be specified")]
    MissingClearType,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("event stream error: {0}")]
    EventStream(String),
}
