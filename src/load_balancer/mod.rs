//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → service identified
//!     → registry resolves the service's eligible targets (snapshot)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through targets)
//!         - least_conn.rs (pick target with fewest in-flight requests)
//!     → registry hands out a TargetGuard counting the request
//! ```
//!
//! # Design Decisions
//! - One balancer per service, owned by the registry entry
//! - Algorithm chosen once from the gateway's load-balancing policy
//! - Unhealthy and draining targets excluded from selection

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::schema::LoadBalancingPolicy;
use crate::registry::target::BackendTarget;

pub mod least_conn;
pub mod round_robin;

pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;

/// Picks one target from a service's replica set.
pub trait LoadBalancer: Send + Sync + Debug {
    fn next_server(&self, targets: &[Arc<BackendTarget>]) -> Option<Arc<BackendTarget>>;
}

pub fn for_policy(policy: LoadBalancingPolicy) -> Arc<dyn LoadBalancer> {
    match policy {
        LoadBalancingPolicy::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalancingPolicy::LeastConnections => Arc::new(LeastConnections::new()),
    }
}
