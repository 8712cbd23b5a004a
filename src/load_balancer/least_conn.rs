//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::target::BackendTarget;

/// Least connections selector.
/// Selects the target with the minimum number of in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, targets: &[Arc<BackendTarget>]) -> Option<Arc<BackendTarget>> {
        // In case of tie, the first one is selected (most recently ready).
        targets
            .iter()
            .filter(|t| t.is_eligible())
            .min_by_key(|t| t.in_flight())
            .cloned()
    }
}
