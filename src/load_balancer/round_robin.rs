//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::target::BackendTarget;

/// Round-robin selector.
/// Stores an internal counter to rotate through targets.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, targets: &[Arc<BackendTarget>]) -> Option<Arc<BackendTarget>> {
        if targets.is_empty() {
            return None;
        }

        // A target can turn ineligible between resolve and selection.
        let start_count = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = targets.len();

        for i in 0..len {
            let index = (start_count + i) % len;
            let target = &targets[index];
            if target.is_eligible() {
                return Some(target.clone());
            }
        }
        None
    }
}
