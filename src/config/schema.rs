//! Supervisor configuration schema.
//!
//! This module defines the `fleetd.toml` structure: the gateway, the service
//! processes to supervise, and the policies applied to them.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::secrets::SecretRef;

/// Root configuration for the supervisor.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Path to the JSON infrastructure document.
    pub infra_config: Option<PathBuf>,

    /// Public gateway settings.
    pub gateway: GatewayConfig,

    /// Service processes to supervise.
    pub services: Vec<ServiceConfig>,

    /// Crash restart policy.
    pub restart: RestartConfig,

    /// Readiness probe applied to every newly started replica.
    pub readiness: ReadinessConfig,

    /// Periodic health checks against registered targets.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

impl FleetConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Make relative paths absolute against the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &std::path::Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.infra_config.as_mut() {
            join(p);
        }
        for listener in &mut self.gateway.listeners {
            if let Some(tls) = listener.tls.as_mut() {
                join(&mut tls.cert_path);
                join(&mut tls.key_path);
            }
        }
        for service in &mut self.services {
            if let Some(p) = service.schema.as_mut() {
                join(p);
            }
            if let Some(p) = service.cwd.as_mut() {
                join(p);
            }
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway name as listed in `hosted_gateways`.
    pub name: String,

    /// Listeners (bind address, TLS).
    pub listeners: Vec<ListenerConfig>,

    /// Total time allowed for one forwarded request in seconds.
    pub request_timeout_secs: u64,

    /// Connection establishment timeout towards targets in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    pub load_balancing: LoadBalancingPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "api-gateway".to_string(),
            listeners: vec![ListenerConfig::default()],
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            load_balancing: LoadBalancingPolicy::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4000").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// One supervised service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical service name; routes and discovery refer to it.
    pub name: String,

    /// Executable to launch.
    pub command: String,

    pub args: Vec<String>,

    /// Working directory for the process.
    pub cwd: Option<PathBuf>,

    /// Extra environment; may not use reserved names.
    pub env: BTreeMap<String, String>,

    /// Number of replicas to run.
    pub replicas: u32,

    /// Path to the service's route schema (JSON).
    pub schema: Option<PathBuf>,

    /// Overrides `readiness.path` for this service.
    pub readiness_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            replicas: 1,
            schema: None,
            readiness_path: None,
        }
    }
}

/// Restart policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Time a replica must stay ready before its failure count resets.
    pub health_window_secs: u64,

    /// Consecutive crashes tolerated before the service is marked failed.
    pub max_consecutive_failures: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            health_window_secs: 60,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    Http,
    Tcp,
    None,
}

/// Readiness probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub probe: ProbeKind,

    /// Path probed for HTTP readiness.
    pub path: String,

    /// Time a new replica has to become ready, in seconds.
    pub timeout_secs: u64,

    pub poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Http,
            path: "/__fleet/ready".to_string(),
            timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/__fleet/ready".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus exporter bind address; metrics are not exported when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_address: None,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token), as an `$env` indirection.
    pub api_key: Option<SecretRef>,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            bind_address: "127.0.0.1:4001".to_string(),
        }
    }
}
