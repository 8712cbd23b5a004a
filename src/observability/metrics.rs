//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway and supervisor metrics
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-service and per-target metrics
//!
//! # Metrics
//! - `fleet_gateway_requests_total` (counter): requests by service, status
//! - `fleet_gateway_request_duration_seconds` (histogram): latency distribution
//! - `fleet_process_restarts_total` (counter): restarts by service
//! - `fleet_process_state_transitions_total` (counter): by service, state
//! - `fleet_registry_ready_targets` (gauge): selectable targets per service
//! - `fleet_target_health` (gauge): 1=healthy, 0=unhealthy
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels for service, target address, status code

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
/// Must be called from within the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record one gateway request.
pub fn record_request(method: &str, status: u16, service: &str, start: Instant) {
    metrics::counter!(
        "fleet_gateway_requests_total",
        "method" => method.to_string(),
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "fleet_gateway_request_duration_seconds",
        "service" => service.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_restart(service: &str) {
    metrics::counter!("fleet_process_restarts_total", "service" => service.to_string()).increment(1);
}

pub fn record_state_transition(service: &str, state: &'static str) {
    metrics::counter!(
        "fleet_process_state_transitions_total",
        "service" => service.to_string(),
        "state" => state
    )
    .increment(1);
}

pub fn record_ready_targets(service: &str, count: usize) {
    metrics::gauge!("fleet_registry_ready_targets", "service" => service.to_string()).set(count as f64);
}

pub fn record_target_health(service: &str, addr: &str, healthy: bool) {
    metrics::gauge!(
        "fleet_target_health",
        "service" => service.to_string(),
        "target" => addr.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}
