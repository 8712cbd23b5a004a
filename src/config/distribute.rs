//! Per-process runtime environment.
//!
//! Each replica receives its configuration through environment variables:
//!
//! | Variable                  | Content                                      |
//! |---------------------------|----------------------------------------------|
//! | `FLEET_SERVICE_NAME`      | logical service name                         |
//! | `FLEET_REPLICA`           | replica index                                |
//! | `FLEET_LISTEN_ADDR`       | assigned loopback address                    |
//! | `PORT`                    | port of the assigned address                 |
//! | `FLEET_RUNTIME_CONFIG`    | JSON: datastores, queues, metrics, keys      |
//! | `FLEET_APP_SECRETS`       | JSON map of secret name to value             |
//! | `FLEET_SERVICE_DISCOVERY` | JSON map of service name to base URL         |
//!
//! Service-specific variables from `fleetd.toml` are merged underneath; they
//! can never replace the variables above.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::config::infra::{
    AuthKey, GracefulShutdown, InfraConfig, MetricsConfig, PubSubProvider, RedisServer, SqlServer,
};
use crate::config::schema::{GatewayConfig, ServiceConfig};
use crate::config::secrets::Secret;

pub const ENV_SERVICE_NAME: &str = "FLEET_SERVICE_NAME";
pub const ENV_REPLICA: &str = "FLEET_REPLICA";
pub const ENV_LISTEN_ADDR: &str = "FLEET_LISTEN_ADDR";
pub const ENV_PORT: &str = "PORT";
pub const ENV_RUNTIME_CONFIG: &str = "FLEET_RUNTIME_CONFIG";
pub const ENV_APP_SECRETS: &str = "FLEET_APP_SECRETS";
pub const ENV_SERVICE_DISCOVERY: &str = "FLEET_SERVICE_DISCOVERY";

/// Names the supervisor sets itself.
pub fn is_reserved_env(name: &str) -> bool {
    name.starts_with("FLEET_") || name == ENV_PORT
}

#[derive(Serialize)]
struct RuntimeConfig<'a> {
    service: &'a str,
    gateway: &'a str,
    sql_servers: &'a [SqlServer<Secret>],
    redis: &'a BTreeMap<String, RedisServer<Secret>>,
    pubsub: &'a [PubSubProvider],
    metrics: Option<&'a MetricsConfig<Secret>>,
    auth: &'a [AuthKey<Secret>],
    graceful_shutdown: GracefulShutdown,
    hosted_services: &'a [String],
}

/// Environment handed to one replica process.
#[derive(Clone)]
pub struct RuntimeEnvironment {
    vars: BTreeMap<String, String>,
}

impl RuntimeEnvironment {
    pub fn for_replica(
        service: &ServiceConfig,
        replica: u32,
        addr: SocketAddr,
        gateway: &GatewayConfig,
        infra: &InfraConfig,
        discovery: &BTreeMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        let mut vars: BTreeMap<String, String> = service
            .env
            .iter()
            .filter(|(k, _)| !is_reserved_env(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let runtime = RuntimeConfig {
            service: &service.name,
            gateway: &gateway.name,
            sql_servers: &infra.sql_servers,
            redis: &infra.redis,
            pubsub: &infra.pubsub,
            metrics: infra.metrics.as_ref(),
            auth: &infra.auth,
            graceful_shutdown: infra.graceful_shutdown,
            hosted_services: &infra.hosted_services,
        };

        vars.insert(ENV_SERVICE_NAME.into(), service.name.clone());
        vars.insert(ENV_REPLICA.into(), replica.to_string());
        vars.insert(ENV_LISTEN_ADDR.into(), addr.to_string());
        vars.insert(ENV_PORT.into(), addr.port().to_string());
        vars.insert(ENV_RUNTIME_CONFIG.into(), serde_json::to_string(&runtime)?);
        vars.insert(ENV_APP_SECRETS.into(), serde_json::to_string(&infra.secrets)?);
        vars.insert(ENV_SERVICE_DISCOVERY.into(), serde_json::to_string(discovery)?);

        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values carry credentials; only names are printed.
        f.debug_struct("RuntimeEnvironment")
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build the discovery map shared by every replica.
///
/// Services hosted by this instance are reached through the gateway, which
/// load-balances across their replicas; external services keep the base URL
/// from the infrastructure document.
pub fn discovery_map(
    infra: &InfraConfig,
    hosted: &[&str],
    gateway_base_url: &str,
) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = infra
        .service_discovery
        .iter()
        .map(|(name, entry)| (name.clone(), entry.base_url.clone()))
        .collect();
    for name in hosted {
        map.insert((*name).to_string(), gateway_base_url.to_string());
    }
    map
}

/// Base URL services use to call each other through the gateway.
pub fn gateway_base_url(gateway: &GatewayConfig) -> String {
    let Some(listener) = gateway.listeners.first() else {
        return "http://127.0.0.1".to_string();
    };
    let scheme = if listener.tls.is_some() { "https" } else { "http" };
    match listener.bind_address.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => format!("{}://127.0.0.1:{}", scheme, addr.port()),
        Ok(addr) => format!("{}://{}", scheme, addr),
        Err(_) => format!("{}://{}", scheme, listener.bind_address),
    }
}
