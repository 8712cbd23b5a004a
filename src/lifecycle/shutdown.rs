//! Shutdown coordination for the fleet.
//!
//! ```text
//! t=0        stop accepting, mark every target draining
//!            wait for in-flight requests      (≤ handlers)
//!            shutdown hooks                   (≤ min(hooks, remaining))
//!            SIGTERM, wait for exit           (until deadline - lead)
//! deadline - lead   SIGKILL, reap             (≤ total deadline)
//! ```
//!
//! The kill lead is one second, or a tenth of the total deadline when that is
//! shorter, so the whole sequence ends by the total deadline.
//! A phase that runs out of time hands over to the next one immediately.
//! Cancelling the force token skips straight to SIGKILL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ShutdownPolicy;
use crate::http::GatewayHandle;
use crate::net::connection::RequestTracker;

/// Time allowed for processes to disappear after a forced SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long before the total deadline SIGKILL goes out.
const KILL_LEAD: Duration = Duration::from_secs(1);

/// Stand-in deadline for totals too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The process side of shutdown.
#[async_trait]
pub trait FleetHandle: Send + Sync {
    /// Take every replica out of rotation; no restarts from here on.
    fn begin_drain(&self);

    /// Invoke every draining replica's shutdown hooks with `budget`.
    /// Returns false if they did not all finish in time.
    async fn run_hooks(&self, budget: Duration) -> bool;

    /// SIGTERM every process.
    fn terminate(&self);

    /// SIGKILL every process.
    fn kill(&self);

    /// Resolve once every process has exited.
    async fn wait_exited(&self);
}

/// The traffic side of shutdown.
#[async_trait]
pub trait Ingress: Send + Sync {
    fn stop_accepting(&self);

    async fn wait_idle_for(&self, limit: Duration) -> bool;

    fn in_flight(&self) -> usize;

    /// Drop whatever is still open.
    fn abort(&self) {}
}

#[async_trait]
impl Ingress for GatewayHandle {
    fn stop_accepting(&self) {
        GatewayHandle::stop_accepting(self)
    }

    async fn wait_idle_for(&self, limit: Duration) -> bool {
        GatewayHandle::wait_idle_for(self, limit).await
    }

    fn in_flight(&self) -> usize {
        GatewayHandle::in_flight(self)
    }

    fn abort(&self) {
        GatewayHandle::abort(self)
    }
}

#[async_trait]
impl Ingress for RequestTracker {
    fn stop_accepting(&self) {}

    async fn wait_idle_for(&self, limit: Duration) -> bool {
        RequestTracker::wait_idle_for(self, limit).await
    }

    fn in_flight(&self) -> usize {
        self.active_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StopAccepting,
    DrainRequests,
    Hooks,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub started: Duration,
    pub elapsed: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub phases: Vec<PhaseReport>,
    /// Hook budget handed to the services.
    pub hook_budget: Duration,
    pub forced_kill: bool,
    pub total: Duration,
}

impl ShutdownReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

pub struct ShutdownCoordinator<F: FleetHandle + ?Sized> {
    policy: ShutdownPolicy,
    fleet: Arc<F>,
    ingress: Vec<Arc<dyn Ingress>>,
    force: CancellationToken,
}

impl<F: FleetHandle + ?Sized> ShutdownCoordinator<F> {
    pub fn new(policy: ShutdownPolicy, fleet: Arc<F>) -> Self {
        Self {
            policy,
            fleet,
            ingress: Vec::new(),
            force: CancellationToken::new(),
        }
    }

    pub fn with_ingress(mut self, ingress: Arc<dyn Ingress>) -> Self {
        self.ingress.push(ingress);
        self
    }

    /// Cancel to skip the remaining phases and kill every process.
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub async fn run(self) -> ShutdownReport {
        let start = Instant::now();
        let deadline = start
            .checked_add(self.policy.total)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let kill_at = deadline
            .checked_sub(KILL_LEAD.min(self.policy.total / 10))
            .unwrap_or(deadline);
        let mut report = ShutdownReport::default();

        tracing::info!(
            total_secs = self.policy.total.as_secs(),
            handlers_secs = self.policy.handlers.as_secs(),
            hooks_secs = self.policy.hooks.as_secs(),
            "Graceful shutdown started"
        );

        // 1. No new work.
        let t = Instant::now();
        for ingress in &self.ingress {
            ingress.stop_accepting();
        }
        self.fleet.begin_drain();
        record(&mut report, start, Phase::StopAccepting, t, false);

        // 2. In-flight requests.
        let mut forced = self.force.is_cancelled();
        if !forced {
            let t = Instant::now();
            let limit = self.policy.handlers.min(remaining(deadline));
            let in_flight: usize = self.ingress.iter().map(|i| i.in_flight()).sum();
            tracing::info!(in_flight, limit_ms = limit.as_millis() as u64, "Draining in-flight requests");

            let drained = tokio::select! {
                results = join_all(self.ingress.iter().map(|i| i.wait_idle_for(limit))) => {
                    results.into_iter().all(|idle| idle)
                }
                _ = self.force.cancelled() => {
                    forced = true;
                    false
                }
            };
            if !drained && !forced {
                let left: usize = self.ingress.iter().map(|i| i.in_flight()).sum();
                tracing::warn!(in_flight = left, "Handler deadline exceeded");
            }
            record(&mut report, start, Phase::DrainRequests, t, !drained);
        }

        // 3. Shutdown hooks.
        if !forced {
            let t = Instant::now();
            let budget = self.policy.hooks.min(remaining(deadline));
            report.hook_budget = budget;
            let finished = tokio::select! {
                result = time::timeout(budget, self.fleet.run_hooks(budget)) => {
                    result.unwrap_or(false)
                }
                _ = self.force.cancelled() => {
                    forced = true;
                    false
                }
            };
            if !finished && !forced {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "Shutdown hooks did not finish in time");
            }
            record(&mut report, start, Phase::Hooks, t, !finished);
        }

        // 4. Terminate, escalating just before the total deadline.
        let t = Instant::now();
        let exited = if forced {
            false
        } else {
            self.fleet.terminate();
            tokio::select! {
                result = time::timeout_at(kill_at, self.fleet.wait_exited()) => result.is_ok(),
                _ = self.force.cancelled() => false,
            }
        };
        if !exited {
            tracing::warn!(forced, "Killing remaining processes");
            report.forced_kill = true;
            self.fleet.kill();
            let reap_by = deadline.min(Instant::now() + KILL_GRACE);
            if time::timeout_at(reap_by, self.fleet.wait_exited()).await.is_err() {
                tracing::error!("Processes not reaped by the shutdown deadline");
            }
        }
        record(&mut report, start, Phase::Terminate, t, !exited);

        for ingress in &self.ingress {
            ingress.abort();
        }

        report.total = start.elapsed();
        tracing::info!(
            elapsed_ms = report.total.as_millis() as u64,
            forced_kill = report.forced_kill,
            "Shutdown complete"
        );
        report
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn record(report: &mut ShutdownReport, start: Instant, phase: Phase, t: Instant, timed_out: bool) {
    report.phases.push(PhaseReport {
        phase,
        started: t.duration_since(start),
        elapsed: t.elapsed(),
        timed_out,
    });
}
