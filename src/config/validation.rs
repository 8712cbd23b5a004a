//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (hosted services have definitions)
//! - Validate value ranges (replicas > 0, backoff base <= cap)
//! - Reject reserved environment names in service settings
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Every error carries the dotted path of the offending field
//! - Runs before any process is spawned

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::distribute::is_reserved_env;
use crate::config::schema::FleetConfig;

/// A single configuration problem, located by field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Builder for dotted field paths such as `sql_servers[0].databases.main`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn root(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn key(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}.{}", self.0, name))
        }
    }

    pub fn index(&self, i: usize) -> Self {
        Self(format!("{}[{}]", self.0, i))
    }

    pub fn error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::new(self.0.clone(), message)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Largest accepted readiness timeout, in seconds.
pub const MAX_READINESS_SECS: u64 = 3600;

/// Validate the supervisor configuration on its own.
///
/// Cross-checks against the infrastructure document happen during resolution.
pub fn validate_config(config: &FleetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let gateway = FieldPath::root("gateway");
    if config.gateway.name.trim().is_empty() {
        errors.push(gateway.key("name").error("must not be empty"));
    }
    if config.gateway.listeners.is_empty() {
        errors.push(gateway.key("listeners").error("at least one listener is required"));
    }
    for (i, listener) in config.gateway.listeners.iter().enumerate() {
        let path = gateway.key("listeners").index(i).key("bind_address");
        if listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(path.error(format!(
                "'{}' is not a valid socket address",
                listener.bind_address
            )));
        }
    }
    if config.gateway.request_timeout_secs == 0 {
        errors.push(gateway.key("request_timeout_secs").error("must be greater than zero"));
    }

    let mut names = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        let path = FieldPath::root("services").index(i);
        if service.name.trim().is_empty() {
            errors.push(path.key("name").error("must not be empty"));
        } else if !names.insert(service.name.as_str()) {
            errors.push(path.key("name").error(format!("duplicate service '{}'", service.name)));
        }
        if service.command.trim().is_empty() {
            errors.push(path.key("command").error("must not be empty"));
        }
        if service.replicas == 0 {
            errors.push(path.key("replicas").error("must be at least 1"));
        }
        for name in service.env.keys() {
            if is_reserved_env(name) {
                errors.push(path.key("env").key(name).error(
                    "reserved name; FLEET_* and PORT are set by the supervisor",
                ));
            }
        }
    }

    let restart = FieldPath::root("restart");
    if config.restart.base_delay_ms == 0 {
        errors.push(restart.key("base_delay_ms").error("must be greater than zero"));
    }
    if config.restart.base_delay_ms > config.restart.max_delay_ms {
        errors.push(restart.key("max_delay_ms").error("must be >= base_delay_ms"));
    }
    if config.restart.max_consecutive_failures == 0 {
        errors.push(restart.key("max_consecutive_failures").error("must be at least 1"));
    }

    let readiness = FieldPath::root("readiness");
    if config.readiness.timeout_secs == 0 {
        errors.push(readiness.key("timeout_secs").error("must be greater than zero"));
    } else if config.readiness.timeout_secs > MAX_READINESS_SECS {
        errors.push(
            readiness
                .key("timeout_secs")
                .error(format!("must be at most {}s", MAX_READINESS_SECS)),
        );
    }
    if !config.readiness.path.starts_with('/') {
        errors.push(readiness.key("path").error("must start with '/'"));
    }

    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(FieldPath::root("health_check").key("interval_secs").error("must be greater than zero"));
    }

    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(
                FieldPath::root("observability")
                    .key("metrics_address")
                    .error(format!("'{}' is not a valid socket address", addr)),
            );
        }
    }

    let admin = FieldPath::root("admin");
    if config.admin.enabled {
        if config.admin.api_key.is_none() {
            errors.push(admin.key("api_key").error("required when the admin API is enabled"));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(admin.key("bind_address").error(format!(
                "'{}' is not a valid socket address",
                config.admin.bind_address
            )));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
