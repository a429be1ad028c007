//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (orchestrator.rs):
//!     Build proxy/cache → auth + sinks → bind listeners → run group
//!
//! Running:
//!     SIGHUP / watcher → Reload → ConfigReloader (log level, TLS)
//!     SIGINT / SIGTERM / quit API → Shutdown
//!
//! Shutdown (shutdown.rs):
//!     cache.set_shutting_down(true) → cancel ctx → actors return
//!     → listeners closed once → PID file removed once
//! ```
//!
//! # Design Decisions
//! - One cancellation token is the only shutdown primitive
//! - Every long-running task is a run-group actor, listeners included
//! - Reload never cancels the shared context

pub mod orchestrator;
pub mod pidfile;
pub mod reload;
pub mod run_group;
pub mod shutdown;
pub mod signals;
pub mod systemd;

pub use orchestrator::{Orchestrator, StartedInfo};
pub use reload::{ConfigReloader, Reload, ReloadError, ReloadFailure, ReloadReceiver};
pub use run_group::{ActorError, RunGroup};
pub use shutdown::{Shutdown, ShutdownListener, ShutdownSequence};
