//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the route table from every service's schema
//! - Bind the gateway and admin listeners
//! - Install the metrics exporter
//! - Spawn replicas and start background tasks
//!
//! # Design Decisions
//! - Fail fast: every fallible step happens in [`prepare`], before any
//!   process is spawned
//! - Listeners are bound before replicas start but only serve once the
//!   supervisor is running

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admin::{self, AdminState};
use crate::config::schema::{FleetConfig, ServiceConfig};
use crate::config::{ConfigError, InfraConfig, ResolvedConfig, Secret, ShutdownPolicy};
use crate::health::HealthMonitor;
use crate::http::{Gateway, GatewayHandle, GatewayState};
use crate::lifecycle::shutdown::{FleetHandle, ShutdownCoordinator, ShutdownReport};
use crate::lifecycle::signals::ShutdownSignals;
use crate::observability::metrics;
use crate::registry::ServiceRegistry;
use crate::routing::{RouteError, RouteTable, ServiceSchema};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load route schema for service '{service}' from {path:?}: {source}")]
    Schema {
        service: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("route schema {path:?} declares service '{found}', expected '{expected}'")]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Routes(#[from] RouteError),

    #[error("failed to bind {what} on {address}: {source}")]
    Bind {
        what: &'static str,
        address: String,
        source: std::io::Error,
    },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Build the route table from every service's schema file.
/// Services without a schema run but receive no gateway traffic.
pub fn build_route_table(services: &[ServiceConfig]) -> Result<RouteTable, StartupError> {
    let mut table = RouteTable::new();
    for service in services {
        let Some(path) = &service.schema else {
            tracing::debug!(service = %service.name, "No route schema; service is not routable");
            continue;
        };
        let schema = ServiceSchema::load(path).map_err(|source| StartupError::Schema {
            service: service.name.clone(),
            path: path.clone(),
            source,
        })?;
        if schema.service != service.name {
            return Err(StartupError::SchemaMismatch {
                path: path.clone(),
                expected: service.name.clone(),
                found: schema.service,
            });
        }
        table.add_schema(&schema)?;
    }
    Ok(table)
}

/// Everything fallible is done; nothing is running yet.
pub struct Prepared {
    config: FleetConfig,
    infra: Arc<InfraConfig>,
    admin_key: Option<Secret>,
    registry: Arc<ServiceRegistry>,
    gateway: Gateway,
    admin_listener: Option<TcpListener>,
}

pub async fn prepare(resolved: ResolvedConfig) -> Result<Prepared, StartupError> {
    let ResolvedConfig {
        fleet,
        infra,
        admin_key,
    } = resolved;

    let routes = build_route_table(&fleet.services)?;
    tracing::info!(
        routes = routes.routes().len(),
        auth_handler = routes.auth_handler().map(|h| h.name.as_str()),
        "Route table built"
    );

    let registry = Arc::new(ServiceRegistry::new(fleet.gateway.load_balancing));
    let infra = Arc::new(infra);
    let state = GatewayState::new(
        fleet.gateway.clone(),
        fleet.health_check.clone(),
        routes,
        registry.clone(),
        infra.clone(),
    );

    let gateway = Gateway::bind(state, &fleet.gateway.listeners)
        .await
        .map_err(|source| StartupError::Bind {
            what: "gateway",
            address: fleet
                .gateway
                .listeners
                .iter()
                .map(|l| l.bind_address.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })?;

    let admin_listener = if fleet.admin.enabled {
        let listener = TcpListener::bind(&fleet.admin.bind_address)
            .await
            .map_err(|source| StartupError::Bind {
                what: "admin API",
                address: fleet.admin.bind_address.clone(),
                source,
            })?;
        Some(listener)
    } else {
        None
    };

    if let Some(address) = &fleet.observability.metrics_address {
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| StartupError::InvalidAddress(address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    Ok(Prepared {
        config: fleet,
        infra,
        admin_key,
        registry,
        gateway,
        admin_listener,
    })
}

impl Prepared {
    pub fn gateway_addrs(&self) -> &[SocketAddr] {
        self.gateway.local_addrs()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Spawn every replica and start serving.
    pub fn launch(self) -> Result<Fleet, StartupError> {
        let client = self.gateway.state().client.clone();
        let routes = self.gateway.state().routes.clone();
        let supervisor = Arc::new(ProcessSupervisor::new(
            &self.config,
            self.infra.clone(),
            self.registry.clone(),
            client.clone(),
        ));

        if let Err(e) = supervisor.start_all() {
            // Slots created before the failure must not outlive us.
            supervisor.kill();
            return Err(e.into());
        }

        let shutting_down = CancellationToken::new();
        let stopped = CancellationToken::new();

        let monitor = HealthMonitor::new(self.registry.clone(), self.config.health_check.clone(), client);
        tokio::spawn(monitor.run(shutting_down.clone()));

        let gateway = Arc::new(self.gateway.serve());

        if let (Some(listener), Some(api_key)) = (self.admin_listener, self.admin_key) {
            let state = AdminState {
                api_key,
                gateway: self.config.gateway.name.clone(),
                registry: self.registry.clone(),
                supervisor: supervisor.clone(),
                routes,
                started: Instant::now(),
                shutting_down: shutting_down.clone(),
            };
            tokio::spawn(admin::serve(listener, state, stopped.clone()));
        }

        tracing::info!(
            gateway = %self.config.gateway.name,
            addresses = ?gateway.local_addrs(),
            "Fleet started"
        );

        Ok(Fleet {
            supervisor,
            gateway,
            registry: self.registry,
            policy: self.infra.shutdown_policy(),
            shutting_down,
            stopped,
        })
    }
}

/// A running fleet.
pub struct Fleet {
    supervisor: Arc<ProcessSupervisor>,
    gateway: Arc<GatewayHandle>,
    registry: Arc<ServiceRegistry>,
    policy: ShutdownPolicy,
    shutting_down: CancellationToken,
    stopped: CancellationToken,
}

impl Fleet {
    pub fn gateway_addrs(&self) -> &[SocketAddr] {
        self.gateway.local_addrs()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> ShutdownCoordinator<ProcessSupervisor> {
        ShutdownCoordinator::new(self.policy, self.supervisor.clone()).with_ingress(self.gateway.clone())
    }

    /// Run the graceful shutdown with `coordinator`.
    pub async fn shutdown(self, coordinator: ShutdownCoordinator<ProcessSupervisor>) -> ShutdownReport {
        self.shutting_down.cancel();
        let report = coordinator.run().await;
        self.stopped.cancel();
        report
    }

    /// Serve until SIGTERM/SIGINT, then shut down. A second signal forces.
    pub async fn run_until_signal(self, mut signals: ShutdownSignals) -> ShutdownReport {
        let name = signals.recv().await;
        tracing::info!(signal = name, "Shutdown requested");

        let coordinator = self.coordinator();
        signals.force_on_next(coordinator.force_token());
        self.shutdown(coordinator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn schema_file(dir: &std::path::Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(json.as_bytes()).unwrap();
        path
    }

    fn service(name: &str, schema: Option<PathBuf>) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            command: "true".into(),
            schema,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_route_table_from_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let blog = schema_file(
            dir.path(),
            "blog.json",
            r#"{"service": "blog", "endpoints": [{"name": "Get", "method": "GET", "path": "/blog/:id", "expose": true}]}"#,
        );
        let table = build_route_table(&[service("blog", Some(blog)), service("worker", None)]).unwrap();
        assert_eq!(table.routes().len(), 1);
    }

    #[test]
    fn test_schema_must_name_its_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = schema_file(dir.path(), "x.json", r#"{"service": "other", "endpoints": []}"#);
        let err = build_route_table(&[service("blog", Some(path))]).unwrap_err();
        assert!(matches!(err, StartupError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_conflicting_schemas_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = schema_file(
            dir.path(),
            "a.json",
            r#"{"service": "a", "endpoints": [{"name": "X", "method": "GET", "path": "/x/:id"}]}"#,
        );
        let b = schema_file(
            dir.path(),
            "b.json",
            r#"{"service": "b", "endpoints": [{"name": "Y", "method": "GET", "path": "/x/:key"}]}"#,
        );
        let err = build_route_table(&[service("a", Some(a)), service("b", Some(b))]).unwrap_err();
        assert!(matches!(err, StartupError::Routes(RouteError::Conflict { .. })));
    }
}
