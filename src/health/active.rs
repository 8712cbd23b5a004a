//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered target
//! - Update target health state based on results

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::schema::HealthCheckConfig;
use crate::health::probe::http_check;
use crate::http::HttpClient;
use crate::observability::metrics;
use crate::registry::ServiceRegistry;

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    config: HealthCheckConfig,
    client: HttpClient,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthCheckConfig, client: HttpClient) -> Self {
        Self {
            registry,
            config,
            client,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.cancelled() => {
                    tracing::debug!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// Probe every target once.
    pub async fn check_all(&self) {
        let timeout = Duration::from_secs(self.config.timeout_secs);

        for target in self.registry.all_targets() {
            let result = http_check(&self.client, target.addr, &self.config.path, timeout).await;
            let changed = match &result {
                Ok(()) => target.mark_success(self.config.healthy_threshold as usize),
                Err(e) => {
                    tracing::debug!(service = %target.service, addr = %target.addr, error = %e, "Health check failed");
                    target.mark_failure(self.config.unhealthy_threshold as usize)
                }
            };
            if changed {
                tracing::warn!(
                    service = %target.service,
                    addr = %target.addr,
                    health = ?target.health(),
                    "Target health changed"
                );
            }
            metrics::record_target_health(&target.service, &target.addr.to_string(), target.is_healthy());
        }
    }
}
