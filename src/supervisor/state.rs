//! Replica lifecycle states.
//!
//! ```text
//! Starting ──▶ Ready ──▶ Draining ──▶ Terminated
//!    │  ▲        │
//!    ▼  │        ▼
//!   Crashed ◀────┘
//!    │
//!    ▼
//!  Failed
//! ```
//!
//! A shutdown during `Starting` or `Crashed` goes straight to `Terminated`.

use std::net::SocketAddr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Draining,
    Terminated,
    Crashed,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Draining => "draining",
            ProcessState::Terminated => "terminated",
            ProcessState::Crashed => "crashed",
            ProcessState::Failed => "failed",
        }
    }

    /// No further transition happens from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Failed)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Crashed)
                | (Starting, Terminated)
                | (Ready, Draining)
                | (Ready, Crashed)
                | (Ready, Terminated)
                | (Draining, Terminated)
                | (Crashed, Starting)
                | (Crashed, Failed)
                | (Crashed, Terminated)
        )
    }
}

/// Supervisor-side record of one replica slot.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceProcessEntry {
    pub service: String,
    pub replica: u32,
    pub pid: Option<u32>,
    pub addr: SocketAddr,
    pub state: ProcessState,
    pub consecutive_failures: u32,
    pub restarts: u64,
    /// Milliseconds since the Unix epoch of the last spawn.
    pub last_start_ms: Option<u64>,
}

impl ServiceProcessEntry {
    pub fn new(service: impl Into<String>, replica: u32, addr: SocketAddr) -> Self {
        Self {
            service: service.into(),
            replica,
            pid: None,
            addr,
            state: ProcessState::Starting,
            consecutive_failures: 0,
            restarts: 0,
            last_start_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ProcessState::*;
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Terminated));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Failed));
        assert!(Starting.can_transition_to(Terminated));

        assert!(!Draining.can_transition_to(Ready));
        assert!(!Draining.can_transition_to(Crashed));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Terminated.can_transition_to(Starting));
        assert!(!Starting.can_transition_to(Draining));
    }

    #[test]
    fn test_terminal() {
        assert!(ProcessState::Failed.is_terminal());
        assert!(ProcessState::Terminated.is_terminal());
        assert!(!ProcessState::Crashed.is_terminal());
    }
}
