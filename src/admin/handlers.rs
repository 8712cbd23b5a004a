use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::registry::TargetSnapshot;
use crate::routing::RouteSummary;
use crate::supervisor::{ProcessState, ServiceProcessEntry};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub gateway: String,
    pub uptime_secs: u64,
    pub services: usize,
    pub failed_services: usize,
    pub replicas_ready: usize,
    pub replicas_total: usize,
}

#[derive(Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub failed: bool,
    pub ready_targets: usize,
    pub targets: Vec<TargetSnapshot>,
    pub replicas: Vec<ServiceProcessEntry>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let services = state.registry.snapshot();
    let replicas = state.supervisor.status();
    let status = if state.shutting_down.is_cancelled() {
        "shutting_down"
    } else if services.iter().any(|s| s.failed) {
        "degraded"
    } else {
        "operational"
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        gateway: state.gateway.clone(),
        uptime_secs: state.started.elapsed().as_secs(),
        services: services.len(),
        failed_services: services.iter().filter(|s| s.failed).count(),
        replicas_ready: replicas.iter().filter(|r| r.state == ProcessState::Ready).count(),
        replicas_total: replicas.len(),
    })
}

pub async fn get_services(State(state): State<AdminState>) -> Json<Vec<ServiceStatus>> {
    let replicas = state.supervisor.status();
    let services = state
        .registry
        .snapshot()
        .into_iter()
        .map(|s| ServiceStatus {
            replicas: replicas.iter().filter(|r| r.service == s.name).cloned().collect(),
            name: s.name,
            failed: s.failed,
            ready_targets: s.ready,
            targets: s.targets,
        })
        .collect();
    Json(services)
}

pub async fn get_routes(State(state): State<AdminState>) -> Json<Vec<RouteSummary>> {
    let routes = state.routes.load();
    Json(routes.routes().iter().map(|r| r.summary()).collect())
}
