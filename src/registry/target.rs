//! Backend target abstraction.
//!
//! # Responsibilities
//! - Represent one ready replica of a service
//! - Track in-flight requests (for Least Connections LB and drain)
//! - Track lifecycle visibility (Ready/Draining/Removed)
//! - Track health state (Healthy/Unhealthy) with hysteresis

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Visibility of a target to the gateway.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Ready = 0,
    Draining = 1,
    Removed = 2,
}

impl From<u8> for TargetState {
    fn from(val: u8) -> Self {
        match val {
            0 => TargetState::Ready,
            1 => TargetState::Draining,
            _ => TargetState::Removed,
        }
    }
}

/// A single ready replica.
///
/// Owned by the registry; the process behind it is owned by its replica task.
#[derive(Debug)]
pub struct BackendTarget {
    pub service: String,
    pub addr: SocketAddr,
    /// Registration order; higher is more recent.
    pub seq: u64,

    state: AtomicU8,
    health: AtomicU8,
    in_flight: AtomicUsize,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
}

impl BackendTarget {
    pub fn new(service: impl Into<String>, addr: SocketAddr, seq: u64) -> Self {
        Self {
            service: service.into(),
            addr,
            seq,
            state: AtomicU8::new(TargetState::Ready as u8),
            health: AtomicU8::new(HealthState::Unknown as u8),
            in_flight: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        }
    }

    /// Number of requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count a request against this target until the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> TargetGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        TargetGuard {
            target: self.clone(),
        }
    }

    pub fn state(&self) -> TargetState {
        TargetState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TargetState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.health.load(Ordering::Relaxed))
    }

    /// Return true if target is considered healthy (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    /// Ready and not unhealthy.
    pub fn is_eligible(&self) -> bool {
        self.state() == TargetState::Ready && self.is_healthy()
    }

    // --- Health Logic ---

    /// Report a successful request/check. Returns true on transition to Healthy.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Healthy {
            return false;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.health.store(HealthState::Healthy as u8, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Report a failed request/check. Returns true on transition to Unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: usize) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Unhealthy {
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.health.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            service: self.service.clone(),
            addr: self.addr,
            seq: self.seq,
            state: self.state(),
            health: self.health(),
            in_flight: self.in_flight(),
        }
    }
}

/// Point-in-time view of a target, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub service: String,
    pub addr: SocketAddr,
    pub seq: u64,
    pub state: TargetState,
    pub health: HealthState,
    pub in_flight: usize,
}

/// A RAII guard that manages the in-flight request count.
#[derive(Debug)]
pub struct TargetGuard {
    target: Arc<BackendTarget>,
}

impl TargetGuard {
    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.target
    }
}

impl Deref for TargetGuard {
    type Target = BackendTarget;
    fn deref(&self) -> &Self::Target {
        &self.target
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.target.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Arc<BackendTarget> {
        Arc::new(BackendTarget::new("blog", "127.0.0.1:9000".parse().unwrap(), 1))
    }

    #[test]
    fn test_guard_counts_in_flight() {
        let t = target();
        let g1 = t.acquire();
        let g2 = t.acquire();
        assert_eq!(t.in_flight(), 2);
        drop(g1);
        assert_eq!(t.in_flight(), 1);
        drop(g2);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_health_hysteresis() {
        let t = target();
        assert!(t.is_healthy());

        assert!(!t.mark_failure(3));
        assert!(!t.mark_failure(3));
        t.mark_success(2);
        assert!(!t.mark_failure(3));
        assert!(t.is_healthy());

        t.mark_failure(3);
        assert!(t.mark_failure(3));
        assert!(!t.is_healthy());
        assert!(!t.is_eligible());

        assert!(!t.mark_success(2));
        assert!(t.mark_success(2));
        assert_eq!(t.health(), HealthState::Healthy);
    }

    #[test]
    fn test_draining_is_not_eligible() {
        let t = target();
        assert!(t.is_eligible());
        t.set_state(TargetState::Draining);
        assert!(!t.is_eligible());
    }
}
