//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Resolve secrets → Build route table → Bind listeners
//!     → Spawn replicas → Serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain requests → Hooks
//!     → SIGTERM → SIGKILL at the deadline
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     Second signal  → Force
//! ```
//!
//! # Design Decisions
//! - Ordered startup: every fallible step happens before any process is spawned
//! - Ordered shutdown with independent deadlines per phase
//! - Shutdown has a total deadline: forced kill after it

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{FleetHandle, Ingress, ShutdownCoordinator, ShutdownReport};
pub use startup::{prepare, Fleet, Prepared, StartupError};
