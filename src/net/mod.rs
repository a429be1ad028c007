//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig
//!     → listener.rs (bind tcp / unix / in-process, load TLS)
//!     → registry.rs (TLS reloaders, filled under the write lock)
//!     → listener::serve (axum or axum-server until the token is cancelled)
//!
//! SIGHUP → TlsRegistry::reload_all → TlsReloader::reload (per listener)
//! ```
//!
//! # Design Decisions
//! - All listeners are bound before any serves
//! - TLS config is swapped in place; live connections are untouched
//! - In-process listeners use duplex pipes, so tests need no ports

pub mod inproc;
pub mod listener;
pub mod registry;
pub mod tls;

pub use inproc::{in_process_pair, DialError, InProcessDialer, InProcessListener};
pub use listener::{serve, start_listener, BoundListener, ListenerAddress, ListenerBundle, ListenerError};
pub use registry::{RegisteredTls, TlsRegistry};
pub use tls::{install_crypto_provider, TlsError, TlsReloader};
