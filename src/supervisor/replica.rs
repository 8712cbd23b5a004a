//! One replica slot: a task owning the process handle across restarts.
//!
//! The task is the only owner of the `Child`. Everything else talks to it
//! through [`ReplicaHandle`]: status is published on a watch channel and
//! commands go in over an mpsc channel.

use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::config::distribute::RuntimeEnvironment;
use crate::config::schema::ServiceConfig;
use crate::health::ReadinessProbe;
use crate::observability::metrics;
use crate::registry::ServiceRegistry;
use crate::supervisor::process;
use crate::supervisor::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::supervisor::state::{ProcessState, ServiceProcessEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Leave the load-balancing set but keep running.
    Drain,
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// Final state of a replica slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaOutcome {
    pub state: ProcessState,
    pub restarts: u64,
}

/// Everything a replica task needs; moved into the task.
pub(crate) struct ReplicaSpec {
    pub service: ServiceConfig,
    pub replica: u32,
    pub addr: SocketAddr,
    pub env: RuntimeEnvironment,
    pub registry: Arc<ServiceRegistry>,
    pub probe: ReadinessProbe,
    pub policy: RestartPolicy,
    /// Replicas of this service not yet failed.
    pub live: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ReplicaHandle {
    status: watch::Receiver<ServiceProcessEntry>,
    control: mpsc::UnboundedSender<Control>,
    expected_exit: Arc<AtomicBool>,
}

impl ReplicaHandle {
    pub fn status(&self) -> ServiceProcessEntry {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.status.borrow().state
    }

    pub fn addr(&self) -> SocketAddr {
        self.status.borrow().addr
    }

    pub fn service(&self) -> String {
        self.status.borrow().service.clone()
    }

    /// Take the replica out of rotation. It will not be restarted again.
    pub fn drain(&self) {
        self.send(Control::Drain);
    }

    pub fn terminate(&self) {
        self.send(Control::Terminate);
    }

    pub fn kill(&self) {
        self.send(Control::Kill);
    }

    fn send(&self, control: Control) {
        // Set before any signal goes out, so the exit is never taken for a crash.
        self.expected_exit.store(true, Ordering::SeqCst);
        let _ = self.control.send(control);
    }

    /// Wait until the replica's state satisfies `f`.
    pub async fn wait_for<F>(&self, mut f: F) -> ServiceProcessEntry
    where
        F: FnMut(ProcessState) -> bool,
    {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(|e| f(e.state)).await.map(|e| e.clone());
        match reached {
            Ok(entry) => entry,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Resolve once the replica reaches a terminal state.
    pub async fn observe(&self) -> ReplicaOutcome {
        let entry = self.wait_for(|s| s.is_terminal()).await;
        ReplicaOutcome {
            state: entry.state,
            restarts: entry.restarts,
        }
    }
}

/// Start the replica task.
pub(crate) fn launch(spec: ReplicaSpec) -> ReplicaHandle {
    let entry = ServiceProcessEntry::new(spec.service.name.clone(), spec.replica, spec.addr);
    let (status_tx, status_rx) = watch::channel(entry);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let expected_exit = Arc::new(AtomicBool::new(false));

    let task = ReplicaTask {
        tracker: RestartTracker::new(spec.policy),
        spec,
        status: status_tx,
        control: control_rx,
        control_open: true,
        expected_exit: expected_exit.clone(),
    };
    tokio::spawn(task.run());

    ReplicaHandle {
        status: status_rx,
        control: control_tx,
        expected_exit,
    }
}

/// How one process lifetime ended.
enum Lifetime {
    Stopped,
    Crashed,
}

struct ReplicaTask {
    spec: ReplicaSpec,
    tracker: RestartTracker,
    status: watch::Sender<ServiceProcessEntry>,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    expected_exit: Arc<AtomicBool>,
}

impl ReplicaTask {
    async fn run(mut self) {
        metrics::record_state_transition(&self.spec.service.name, ProcessState::Starting.as_str());
        loop {
            if self.stopping() {
                self.transition(ProcessState::Terminated);
                return;
            }

            match self.run_once().await {
                Lifetime::Stopped => {
                    self.transition(ProcessState::Terminated);
                    return;
                }
                Lifetime::Crashed => {
                    self.spec.registry.deregister(&self.spec.service.name, self.spec.addr);
                    self.transition(ProcessState::Crashed);

                    let now = Instant::now();
                    let decision = self.tracker.record_crash(now);
                    let failures = self.tracker.consecutive_failures(now);
                    let restarts = self.tracker.restarts();
                    self.status.send_modify(|e| {
                        e.pid = None;
                        e.consecutive_failures = failures;
                        e.restarts = restarts;
                    });

                    match decision {
                        RestartDecision::GiveUp => {
                            tracing::error!(
                                service = %self.spec.service.name,
                                replica = self.spec.replica,
                                failures,
                                "Replica exceeded its restart budget"
                            );
                            // Registry first, so observers of Failed see the service state.
                            if self.spec.live.fetch_sub(1, Ordering::SeqCst) == 1 {
                                self.spec.registry.mark_failed(&self.spec.service.name);
                            }
                            self.transition(ProcessState::Failed);
                            return;
                        }
                        RestartDecision::Restart(delay) => {
                            tracing::info!(
                                service = %self.spec.service.name,
                                replica = self.spec.replica,
                                delay_ms = delay.as_millis() as u64,
                                failures,
                                "Restarting replica"
                            );
                            metrics::record_restart(&self.spec.service.name);
                            if !self.backoff(delay).await {
                                self.transition(ProcessState::Terminated);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn stopping(&self) -> bool {
        self.expected_exit.load(Ordering::SeqCst)
    }

    fn state(&self) -> ProcessState {
        self.status.borrow().state
    }

    fn transition(&self, next: ProcessState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            tracing::debug!(
                service = %self.spec.service.name,
                from = prev.as_str(),
                to = next.as_str(),
                "Unexpected replica transition"
            );
        }
        self.status.send_modify(|e| e.state = next);
        metrics::record_state_transition(&self.spec.service.name, next.as_str());
        tracing::info!(
            service = %self.spec.service.name,
            replica = self.spec.replica,
            addr = %self.spec.addr,
            from = prev.as_str(),
            to = next.as_str(),
            "Replica state changed"
        );
    }

    /// Every handle is gone; treat it as a kill request.
    fn on_closed(&mut self) -> Control {
        self.control_open = false;
        self.expected_exit.store(true, Ordering::SeqCst);
        Control::Kill
    }

    /// Sleep out a restart delay. Returns false if shutdown began meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => !self.stopping(),
            cmd = self.control.recv(), if self.control_open => {
                if cmd.is_none() {
                    self.on_closed();
                }
                false
            }
        }
    }

    async fn run_once(&mut self) -> Lifetime {
        let service = self.spec.service.name.clone();
        let replica = self.spec.replica;
        let addr = self.spec.addr;

        self.transition(ProcessState::Starting);
        let started_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();

        let mut child = match process::spawn(&self.spec.service, replica, &self.spec.env) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(service = %service, replica, error = %e, "Spawn failed");
                return Lifetime::Crashed;
            }
        };
        let pid = child.id();
        self.status.send_modify(|e| {
            e.pid = pid;
            e.last_start_ms = started_ms;
        });
        tracing::info!(service = %service, replica, pid, addr = %addr, "Process started");

        // Starting: wait for readiness, exit or a shutdown request.
        let probe = self.spec.probe.clone();
        let ready = probe.wait_ready(addr);
        tokio::pin!(ready);
        let became_ready = tokio::select! {
            ok = &mut ready => ok,
            status = child.wait() => {
                self.log_exit(status);
                return self.lifetime_end();
            }
            cmd = self.control.recv(), if self.control_open => {
                let cmd = cmd.unwrap_or_else(|| self.on_closed());
                // Never became ready, so nothing to drain.
                let sig = if cmd == Control::Kill { Signal::SIGKILL } else { Signal::SIGTERM };
                self.signal(&child, sig);
                self.reap(&mut child).await;
                return Lifetime::Stopped;
            }
        };

        if !became_ready {
            tracing::warn!(
                service = %service,
                replica,
                timeout_secs = probe.timeout().as_secs(),
                "Replica did not become ready in time"
            );
            self.signal(&child, Signal::SIGKILL);
            self.reap(&mut child).await;
            return self.lifetime_end();
        }

        // Ready: visible to the gateway until exit, drain or termination.
        self.spec.registry.register(&service, addr);
        self.tracker.mark_ready(Instant::now());
        self.transition(ProcessState::Ready);
        if self.stopping() {
            // A drain raced with readiness; honour it.
            self.spec.registry.mark_draining(&service, addr);
            self.transition(ProcessState::Draining);
        }

        loop {
            tokio::select! {
                status = child.wait() => {
                    self.log_exit(status);
                    self.spec.registry.deregister(&service, addr);
                    return self.lifetime_end();
                }
                cmd = self.control.recv(), if self.control_open => {
                    let cmd = cmd.unwrap_or_else(|| self.on_closed());
                    match cmd {
                        Control::Drain => {
                            if self.state() == ProcessState::Ready {
                                self.spec.registry.mark_draining(&service, addr);
                                self.transition(ProcessState::Draining);
                            }
                        }
                        Control::Terminate | Control::Kill => {
                            self.spec.registry.deregister(&service, addr);
                            let sig = if cmd == Control::Kill { Signal::SIGKILL } else { Signal::SIGTERM };
                            self.signal(&child, sig);
                            self.reap(&mut child).await;
                            return Lifetime::Stopped;
                        }
                    }
                }
            }
        }
    }

    fn lifetime_end(&self) -> Lifetime {
        if self.stopping() {
            Lifetime::Stopped
        } else {
            Lifetime::Crashed
        }
    }

    fn signal(&self, child: &Child, sig: Signal) {
        if let Err(e) = process::send_signal(child, sig) {
            tracing::warn!(service = %self.spec.service.name, error = %e, "Signal delivery failed");
        }
    }

    /// Wait for the child to exit; a kill request meanwhile escalates.
    async fn reap(&mut self, child: &mut Child) {
        loop {
            tokio::select! {
                status = child.wait() => {
                    self.log_exit(status);
                    return;
                }
                cmd = self.control.recv(), if self.control_open => {
                    let cmd = cmd.unwrap_or_else(|| self.on_closed());
                    if cmd == Control::Kill {
                        self.signal(child, Signal::SIGKILL);
                    }
                }
            }
        }
    }

    fn log_exit(&self, status: std::io::Result<ExitStatus>) {
        let service = &self.spec.service.name;
        let replica = self.spec.replica;
        match status {
            Ok(status) if self.stopping() => {
                tracing::info!(service = %service, replica, code = ?status.code(), signal = ?status.signal(), "Process exited");
            }
            Ok(status) => {
                tracing::warn!(service = %service, replica, code = ?status.code(), signal = ?status.signal(), "Process exited unexpectedly");
            }
            Err(e) => {
                tracing::error!(service = %service, replica, error = %e, "Failed to wait for process");
            }
        }
    }
}
