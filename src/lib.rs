//! Vault Proxy Library
//!
//! A local sidecar that authenticates to an upstream secrets server on the
//! caller's behalf, writes the resulting token to sinks, forwards API
//! requests with optional lease caching, and serves them on TCP, Unix or
//! in-process listeners.

// Core subsystems
pub mod auth;
pub mod cache;
pub mod config;
pub mod http;
pub mod net;
pub mod proxy;
pub mod sink;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::Config;
pub use lifecycle::{Orchestrator, Shutdown};
