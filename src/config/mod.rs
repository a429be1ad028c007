//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! -config files (TOML, merged in order)
//!     → loader.rs (parse, merge & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → overrides.rs (flag > env > file > default for [vault])
//!     → Config (validated, immutable)
//!
//! On reload signal (SIGHUP or watcher.rs):
//!     loader.rs loads new config
//!     → on error: keep running config, report failure
//!     → on success: log level + listener certs re-applied,
//!       atomic swap of Arc<Config>
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a reload only re-applies log level and TLS material
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod duration;
pub mod loader;
pub mod overrides;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_configs, ConfigError};
pub use overrides::VaultOverrides;
pub use watcher::ConfigWatcher;
pub use schema::{
    ApiProxyConfig, AutoAuthConfig, CacheConfig, Config, ListenerConfig, ListenerRole,
    ListenerType, MethodConfig, PersistConfig, ProxyApiConfig, SinkConfig, UseAutoAuthToken,
    VaultConfig,
};
