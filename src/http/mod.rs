//! HTTP layer served by every listener.
//!
//! # Data Flow
//! ```text
//! Listener connection
//!     → server.rs (request ID, body limit, trace)
//!     → proxy_api.rs (metrics, cache-clear, quit)
//!     → proxy::handler (everything else)
//!     → response.rs (error bodies)
//! ```

pub mod proxy_api;
pub mod request;
pub mod response;
pub mod server;

pub use request::{MAX_REQUEST_SIZE, X_REQUEST_ID, X_VAULT_REQUEST};
pub use server::{build_router, RouterState};
