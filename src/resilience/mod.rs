//! Resilience primitives.
//!
//! # Data Flow
//! ```text
//! Failed authentication / upstream call / event stream drop:
//!     → backoff.rs (exponential delay with jitter, bounded by [min, max])
//!     → caller sleeps (cancellable) and retries
//!     → success resets the backoff
//! ```
//!
//! # Design Decisions
//! - Every retry loop waits on the shared cancellation token, never a bare sleep
//! - Jitter only shortens the delay, so configured maxima are hard limits

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
