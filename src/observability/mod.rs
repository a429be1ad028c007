//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, reloadable level)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (standard or JSON lines)
//!     → /proxy/v1/metrics (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging for machine parsing
//! - Request ID flows from the listener into every proxied request's span
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{LogHandle, LoggingError};
