//! Process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! start_all
//!     → allocate loopback address per replica slot
//!     → RuntimeEnvironment::for_replica (config distribution)
//!     → replica task: spawn → readiness probe → register
//!                     exit → backoff → respawn │ give up → failed
//! ```
//!
//! # Design Decisions
//! - Each replica slot is one task that exclusively owns its `Child`
//! - The supervisor reaches replicas only through their handles
//! - A slot keeps its address across restarts and only respawns after the
//!   previous process has been reaped

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use dashmap::DashMap;
use futures_util::future::join_all;

use crate::config::distribute::{discovery_map, gateway_base_url, RuntimeEnvironment};
use crate::config::schema::{FleetConfig, GatewayConfig, ReadinessConfig, ServiceConfig};
use crate::config::InfraConfig;
use crate::health::ReadinessProbe;
use crate::http::request::{SHUTDOWN_PATH, X_FLEET_HOOK_BUDGET_MS};
use crate::http::HttpClient;
use crate::lifecycle::shutdown::FleetHandle;
use crate::registry::ServiceRegistry;

pub mod process;
pub mod replica;
pub mod restart;
pub mod state;

pub use replica::{ReplicaHandle, ReplicaOutcome};
pub use restart::{RestartDecision, RestartPolicy, RestartTracker};
pub use state::{ProcessState, ServiceProcessEntry};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn service '{service}': {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },

    #[error("failed to allocate a listen address: {0}")]
    Address(#[source] std::io::Error),

    #[error("failed to build environment for service '{service}': {source}")]
    Environment {
        service: String,
        source: serde_json::Error,
    },

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("failed to signal process {pid}: {source}")]
    Signal { pid: u32, source: nix::errno::Errno },
}

pub struct ProcessSupervisor {
    services: Vec<ServiceConfig>,
    gateway: GatewayConfig,
    readiness: ReadinessConfig,
    policy: RestartPolicy,
    infra: Arc<InfraConfig>,
    registry: Arc<ServiceRegistry>,
    client: HttpClient,
    discovery: BTreeMap<String, String>,
    replicas: Mutex<Vec<ReplicaHandle>>,
    /// Replicas that were serving when shutdown began; they get hook calls.
    draining: Mutex<Vec<ReplicaHandle>>,
    live: DashMap<String, Arc<AtomicUsize>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: &FleetConfig,
        infra: Arc<InfraConfig>,
        registry: Arc<ServiceRegistry>,
        client: HttpClient,
    ) -> Self {
        let hosted: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
        let discovery = discovery_map(&infra, &hosted, &gateway_base_url(&config.gateway));

        Self {
            services: config.services.clone(),
            gateway: config.gateway.clone(),
            readiness: config.readiness.clone(),
            policy: RestartPolicy::from_config(&config.restart),
            infra,
            registry,
            client,
            discovery,
            replicas: Mutex::new(Vec::new()),
            draining: Mutex::new(Vec::new()),
            live: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ReplicaHandle>> {
        self.replicas.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start every replica of every configured service.
    pub fn start_all(&self) -> Result<(), SupervisorError> {
        for service in &self.services {
            for replica in 0..service.replicas {
                self.start(&service.name, replica)?;
            }
        }
        tracing::info!(
            services = self.services.len(),
            replicas = self.lock().len(),
            "All replicas launched"
        );
        Ok(())
    }

    /// Start one replica slot.
    pub fn start(&self, service: &str, replica: u32) -> Result<ReplicaHandle, SupervisorError> {
        let config = self
            .services
            .iter()
            .find(|s| s.name == service)
            .ok_or_else(|| SupervisorError::UnknownService(service.to_string()))?;

        let addr = process::allocate_address().map_err(SupervisorError::Address)?;
        let env = RuntimeEnvironment::for_replica(
            config,
            replica,
            addr,
            &self.gateway,
            &self.infra,
            &self.discovery,
        )
        .map_err(|source| SupervisorError::Environment {
            service: service.to_string(),
            source,
        })?;

        let live = self.live.entry(service.to_string()).or_default().clone();
        live.fetch_add(1, Ordering::SeqCst);
        self.registry.ensure_service(service);

        let probe = ReadinessProbe::new(&self.readiness, self.client.clone())
            .with_path(config.readiness_path.as_deref());
        let handle = replica::launch(replica::ReplicaSpec {
            service: config.clone(),
            replica,
            addr,
            env,
            registry: self.registry.clone(),
            probe,
            policy: self.policy,
            live,
        });

        tracing::debug!(service, replica, addr = %addr, "Replica slot created");
        self.lock().push(handle.clone());
        Ok(handle)
    }

    pub fn replicas(&self) -> Vec<ReplicaHandle> {
        self.lock().clone()
    }

    pub fn status(&self) -> Vec<ServiceProcessEntry> {
        self.lock().iter().map(|r| r.status()).collect()
    }

    /// Wait until every replica is ready or has given up.
    pub async fn wait_started(&self) {
        let replicas = self.replicas();
        join_all(replicas.iter().map(|r| {
            r.wait_for(|s| matches!(s, ProcessState::Ready | ProcessState::Draining) || s.is_terminal())
        }))
        .await;
    }

    async fn call_hook(&self, replica: &ReplicaHandle, budget: Duration) {
        let addr = replica.addr();
        let request = Request::post(format!("http://{}{}", addr, SHUTDOWN_PATH))
            .header(X_FLEET_HOOK_BUDGET_MS, budget.as_millis().to_string())
            .body(Body::empty());
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build shutdown hook request");
                return;
            }
        };

        tokio::select! {
            result = self.client.request(request) => match result {
                Ok(response) => {
                    tracing::debug!(service = %replica.service(), addr = %addr, status = %response.status(), "Shutdown hooks finished");
                }
                Err(e) => {
                    tracing::warn!(service = %replica.service(), addr = %addr, error = %e, "Shutdown hook call failed");
                }
            },
            _ = replica.observe() => {
                tracing::debug!(service = %replica.service(), addr = %addr, "Process exited during shutdown hooks");
            }
        }
    }
}

#[async_trait]
impl FleetHandle for ProcessSupervisor {
    fn begin_drain(&self) {
        let mut serving = Vec::new();
        for replica in self.lock().iter() {
            if matches!(replica.state(), ProcessState::Ready | ProcessState::Draining) {
                serving.push(replica.clone());
            }
            replica.drain();
        }
        *self.draining.lock().unwrap_or_else(|e| e.into_inner()) = serving;
        self.registry.mark_all_draining();
    }

    async fn run_hooks(&self, budget: Duration) -> bool {
        // The replica tasks may not have handled the drain command yet, so
        // select by the set recorded in begin_drain rather than current state.
        let draining: Vec<ReplicaHandle> = self
            .draining
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| !r.state().is_terminal())
            .cloned()
            .collect();
        if draining.is_empty() {
            return true;
        }

        tracing::info!(replicas = draining.len(), budget_ms = budget.as_millis() as u64, "Running shutdown hooks");
        let calls = join_all(draining.iter().map(|r| self.call_hook(r, budget)));
        tokio::time::timeout(budget, calls).await.is_ok()
    }

    fn terminate(&self) {
        for replica in self.lock().iter() {
            replica.terminate();
        }
    }

    fn kill(&self) {
        for replica in self.lock().iter() {
            replica.kill();
        }
    }

    async fn wait_exited(&self) {
        let replicas = self.replicas();
        join_all(replicas.iter().map(|r| r.observe())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ProbeKind, RestartConfig};
    use crate::http::server::build_client;

    fn supervisor(services: Vec<ServiceConfig>) -> ProcessSupervisor {
        let config = FleetConfig {
            services,
            restart: RestartConfig {
                base_delay_ms: 10,
                max_delay_ms: 50,
                health_window_secs: 60,
                max_consecutive_failures: 2,
            },
            readiness: ReadinessConfig {
                probe: ProbeKind::None,
                ..ReadinessConfig::default()
            },
            ..FleetConfig::default()
        };
        let infra = crate::config::resolve::resolve(
            &crate::config::InfraDocument::default(),
            &std::collections::HashMap::<String, String>::new(),
        )
        .unwrap();
        ProcessSupervisor::new(
            &config,
            Arc::new(infra),
            Arc::new(ServiceRegistry::default()),
            build_client(&config.gateway),
        )
    }

    fn service(name: &str, script: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let sup = supervisor(vec![]);
        assert!(matches!(sup.start("nope", 0), Err(SupervisorError::UnknownService(_))));
    }

    #[tokio::test]
    async fn test_crash_loop_marks_service_failed() {
        let sup = supervisor(vec![service("flaky", "exit 3")]);
        let handle = sup.start("flaky", 0).unwrap();

        let outcome = handle.observe().await;
        assert_eq!(outcome.state, ProcessState::Failed);
        assert_eq!(outcome.restarts, 2);
        assert!(sup.registry().is_failed("flaky"));
    }

    #[tokio::test]
    async fn test_terminate_is_not_a_crash() {
        let sup = supervisor(vec![service("sleeper", "exec sleep 30")]);
        let handle = sup.start("sleeper", 0).unwrap();
        handle.wait_for(|s| s == ProcessState::Ready).await;
        assert_eq!(sup.registry().resolve("sleeper").len(), 1);

        sup.terminate();
        let outcome = handle.observe().await;
        assert_eq!(outcome.state, ProcessState::Terminated);
        assert_eq!(outcome.restarts, 0);
        assert!(sup.registry().resolve("sleeper").is_empty());
        assert!(!sup.registry().is_failed("sleeper"));
    }

    #[tokio::test]
    async fn test_drain_keeps_process_running() {
        let sup = supervisor(vec![service("worker", "exec sleep 30")]);
        let handle = sup.start("worker", 0).unwrap();
        handle.wait_for(|s| s == ProcessState::Ready).await;

        sup.begin_drain();
        let entry = handle.wait_for(|s| s == ProcessState::Draining).await;
        assert!(entry.pid.is_some());
        assert!(sup.registry().resolve("worker").is_empty());

        sup.kill();
        sup.wait_exited().await;
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_hooks_reach_replica_drained_just_before() {
        use axum::http::HeaderMap;
        use axum::routing::post;
        use axum::Router;

        let sup = supervisor(vec![service("worker", "exec sleep 30")]);
        let handle = sup.start("worker", 0).unwrap();
        handle.wait_for(|s| s == ProcessState::Ready).await;

        // Stand in for the service's hook endpoint on the replica's address.
        let budgets = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = budgets.clone();
        let app = Router::new().route(
            SHUTDOWN_PATH,
            post(move |headers: HeaderMap| {
                let seen = seen.clone();
                async move {
                    let budget = headers
                        .get(X_FLEET_HOOK_BUDGET_MS)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    seen.lock().unwrap().push(budget);
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind(handle.addr()).await.unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        sup.begin_drain();
        assert!(sup.run_hooks(Duration::from_secs(2)).await);
        assert_eq!(*budgets.lock().unwrap(), vec!["2000".to_string()]);

        sup.kill();
        sup.wait_exited().await;
    }
}
