//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Readiness (probe.rs):
//!     Replica started
//!     → Poll probe until success or timeout
//!     → Supervisor registers the target
//!
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each registered target
//!     → mark_success / mark_failure on the target
//!
//! Passive health checks (http/server.rs):
//!     Forwarding outcome observed
//!     → mark_success / mark_failure on the target
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - State transitions require consecutive successes/failures
//! - Health state is per-target, not per-service

pub mod active;
pub mod probe;

pub use active::HealthMonitor;
pub use probe::ReadinessProbe;
