//! Service registry.
//!
//! # Responsibilities
//! - Map logical service names to their ready targets
//! - Publish supervisor transitions (ready, draining, exited, failed)
//! - Hand out targets to the gateway per request
//!
//! # Design Decisions
//! - Each service's replica set is an immutable `Arc<Vec<_>>` snapshot,
//!   replaced whole under the service's `DashMap` shard lock. Readers clone
//!   the `Arc` and never observe a half-updated set; writers to one service
//!   are linearized.
//! - Selection happens outside the lock on the cloned snapshot
//! - Eligible targets are ordered most recently ready first
//!
//! # Data Flow
//! ```text
//! supervisor ──register/deregister/mark_*──▶ ServiceRegistry ◀──select── gateway
//!                                                 │
//!                                     health monitor (all_targets)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::LoadBalancingPolicy;
use crate::load_balancer::{self, LoadBalancer};
use crate::observability::metrics;

pub mod target;

pub use target::{BackendTarget, HealthState, TargetGuard, TargetSnapshot, TargetState};

/// Why no target could be selected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no live target for service '{0}'")]
    NoLiveTarget(String),
    #[error("service '{0}' has failed")]
    ServiceFailed(String),
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    targets: Arc<Vec<Arc<BackendTarget>>>,
    balancer: Arc<dyn LoadBalancer>,
    failed: bool,
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub failed: bool,
    pub ready: usize,
    pub targets: Vec<TargetSnapshot>,
}

#[derive(Debug)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
    seq: AtomicU64,
    policy: LoadBalancingPolicy,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(LoadBalancingPolicy::default())
    }
}

impl ServiceRegistry {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            services: DashMap::new(),
            seq: AtomicU64::new(0),
            policy,
        }
    }

    fn new_entry(&self) -> ServiceEntry {
        ServiceEntry {
            targets: Arc::new(Vec::new()),
            balancer: load_balancer::for_policy(self.policy),
            failed: false,
        }
    }

    /// Make a service known before any of its replicas is ready.
    pub fn ensure_service(&self, service: &str) {
        self.services
            .entry(service.to_string())
            .or_insert_with(|| self.new_entry());
    }

    /// Make a ready replica visible. Replaces any target at the same address.
    pub fn register(&self, service: &str, addr: SocketAddr) -> Arc<BackendTarget> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let target = Arc::new(BackendTarget::new(service, addr, seq));

        let mut entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| self.new_entry());
        let mut next: Vec<_> = entry
            .targets
            .iter()
            .filter(|t| t.addr != addr)
            .cloned()
            .collect();
        next.push(target.clone());
        entry.targets = Arc::new(next);
        entry.failed = false;
        let ready = count_ready(&entry.targets);
        drop(entry);

        metrics::record_ready_targets(service, ready);
        tracing::info!(service, address = %addr, seq, "Target registered");
        target
    }

    /// Remove a target, typically after its process exited.
    pub fn deregister(&self, service: &str, addr: SocketAddr) -> Option<Arc<BackendTarget>> {
        let mut entry = self.services.get_mut(service)?;
        let removed = entry.targets.iter().find(|t| t.addr == addr).cloned()?;
        removed.set_state(TargetState::Removed);
        let next: Vec<_> = entry
            .targets
            .iter()
            .filter(|t| t.addr != addr)
            .cloned()
            .collect();
        entry.targets = Arc::new(next);
        let ready = count_ready(&entry.targets);
        drop(entry);

        metrics::record_ready_targets(service, ready);
        tracing::info!(service, address = %addr, "Target deregistered");
        Some(removed)
    }

    /// Stop routing new requests to one target. In-flight requests continue.
    pub fn mark_draining(&self, service: &str, addr: SocketAddr) -> bool {
        let Some(entry) = self.services.get(service) else {
            return false;
        };
        let Some(target) = entry.targets.iter().find(|t| t.addr == addr) else {
            return false;
        };
        target.set_state(TargetState::Draining);
        let ready = count_ready(&entry.targets);
        drop(entry);

        metrics::record_ready_targets(service, ready);
        tracing::debug!(service, address = %addr, "Target draining");
        true
    }

    /// Stop routing new requests anywhere.
    pub fn mark_all_draining(&self) {
        for entry in self.services.iter() {
            for target in entry.targets.iter() {
                if target.state() == TargetState::Ready {
                    target.set_state(TargetState::Draining);
                }
            }
            metrics::record_ready_targets(entry.key(), 0);
        }
        tracing::info!("All targets draining");
    }

    /// Give up on a service for the rest of the run.
    pub fn mark_failed(&self, service: &str) {
        let mut entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| self.new_entry());
        for target in entry.targets.iter() {
            target.set_state(TargetState::Removed);
        }
        entry.targets = Arc::new(Vec::new());
        entry.failed = true;
        drop(entry);

        metrics::record_ready_targets(service, 0);
        tracing::error!(service, "Service marked failed");
    }

    pub fn is_failed(&self, service: &str) -> bool {
        self.services.get(service).map(|e| e.failed).unwrap_or(false)
    }

    /// Eligible targets (ready and not unhealthy), most recently ready first.
    pub fn resolve(&self, service: &str) -> Vec<Arc<BackendTarget>> {
        let Some(targets) = self.services.get(service).map(|e| e.targets.clone()) else {
            return Vec::new();
        };
        eligible(&targets, &[])
    }

    /// Pick a target for one request, skipping the addresses in `exclude`.
    pub fn select(&self, service: &str, exclude: &[SocketAddr]) -> Result<TargetGuard, SelectError> {
        let (targets, balancer, failed) = match self.services.get(service) {
            Some(e) => (e.targets.clone(), e.balancer.clone(), e.failed),
            None => return Err(SelectError::NoLiveTarget(service.to_string())),
        };
        if failed {
            return Err(SelectError::ServiceFailed(service.to_string()));
        }
        let candidates = eligible(&targets, exclude);
        balancer
            .next_server(&candidates)
            .map(|t| t.acquire())
            .ok_or_else(|| SelectError::NoLiveTarget(service.to_string()))
    }

    /// Every target currently known, regardless of state.
    pub fn all_targets(&self) -> Vec<Arc<BackendTarget>> {
        self.services
            .iter()
            .flat_map(|e| e.targets.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Total requests in flight across all targets.
    pub fn in_flight(&self) -> usize {
        self.all_targets().iter().map(|t| t.in_flight()).sum()
    }

    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .map(|e| ServiceSnapshot {
                name: e.key().clone(),
                failed: e.failed,
                ready: count_ready(&e.targets),
                targets: e.targets.iter().map(|t| t.snapshot()).collect(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }
}

fn count_ready(targets: &[Arc<BackendTarget>]) -> usize {
    targets.iter().filter(|t| t.is_eligible()).count()
}

fn eligible(targets: &[Arc<BackendTarget>], exclude: &[SocketAddr]) -> Vec<Arc<BackendTarget>> {
    let mut out: Vec<_> = targets
        .iter()
        .filter(|t| t.is_eligible() && !exclude.contains(&t.addr))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.seq.cmp(&a.seq));
    out
}
