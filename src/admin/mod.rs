//! Admin API.
//!
//! Read-only views of the fleet, protected by a bearer key and bound to a
//! separate listener from the gateway.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::config::Secret;
use crate::registry::ServiceRegistry;
use crate::routing::RouteTable;
use crate::supervisor::ProcessSupervisor;

#[derive(Clone)]
pub struct AdminState {
    pub api_key: Secret,
    pub gateway: String,
    pub registry: Arc<ServiceRegistry>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub started: Instant,
    /// Cancelled when shutdown begins.
    pub shutting_down: CancellationToken,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(get_services))
        .route("/admin/routes", get(get_routes))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until `stop` is cancelled.
pub async fn serve(listener: TcpListener, state: AdminState, stop: CancellationToken) {
    let addr = listener.local_addr().ok();
    tracing::info!(address = ?addr, "Admin API listening");
    let result = axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(stop.cancelled_owned())
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Admin API failed");
    }
}
