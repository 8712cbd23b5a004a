//! Readiness probes for freshly started replicas.
//!
//! A replica counts as ready once a probe succeeds against its assigned
//! address. Probes are polled until the readiness timeout elapses.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::config::schema::{ProbeKind, ReadinessConfig};
use crate::http::HttpClient;

/// Upper bound for a single probe attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// GET `path` on `addr`; any 2xx is a success.
pub async fn http_check(
    client: &HttpClient,
    addr: SocketAddr,
    path: &str,
    timeout: Duration,
) -> Result<(), String> {
    let request = Request::get(format!("http://{}{}", addr, path))
        .header("user-agent", "fleetd-health-check")
        .body(Body::empty())
        .map_err(|e| e.to_string())?;

    match time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) if response.status().is_success() => Ok(()),
        Ok(Ok(response)) => Err(format!("status {}", response.status())),
        Ok(Err(e)) => Err(format!("connection error: {}", e)),
        Err(_) => Err("timeout".to_string()),
    }
}

pub async fn tcp_check(addr: SocketAddr, timeout: Duration) -> Result<(), String> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timeout".to_string()),
    }
}

#[derive(Clone)]
pub struct ReadinessProbe {
    kind: ProbeKind,
    path: String,
    timeout: Duration,
    poll_interval: Duration,
    client: HttpClient,
}

impl ReadinessProbe {
    pub fn new(config: &ReadinessConfig, client: HttpClient) -> Self {
        Self {
            kind: config.probe,
            path: config.path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            client,
        }
    }

    /// Override the probed path for one service.
    pub fn with_path(mut self, path: Option<&str>) -> Self {
        if let Some(path) = path {
            self.path = path.to_string();
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One probe attempt.
    pub async fn check(&self, addr: SocketAddr) -> bool {
        let result = match self.kind {
            ProbeKind::None => Ok(()),
            ProbeKind::Tcp => tcp_check(addr, ATTEMPT_TIMEOUT).await,
            ProbeKind::Http => http_check(&self.client, addr, &self.path, ATTEMPT_TIMEOUT).await,
        };
        if let Err(e) = &result {
            tracing::trace!(addr = %addr, error = %e, "Readiness probe not yet passing");
        }
        result.is_ok()
    }

    /// Poll until the probe passes. Returns false once the readiness
    /// timeout has elapsed without success.
    pub async fn wait_ready(&self, addr: SocketAddr) -> bool {
        let deadline = Instant::now().checked_add(self.timeout);
        loop {
            if self.check(addr).await {
                return true;
            }
            let next = Instant::now().checked_add(self.poll_interval);
            if let (Some(deadline), Some(next)) = (deadline, next) {
                if next > deadline {
                    return false;
                }
            }
            time::sleep(self.poll_interval).await;
        }
    }
}
