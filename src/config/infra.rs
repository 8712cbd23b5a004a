//! Infrastructure configuration document.
//!
//! The document is JSON and describes everything the supervised services need
//! to reach their backing infrastructure. Every credential is written as an
//! `{"$env": "NAME"}` indirection.
//!
//! # Design Decisions
//! - One generic tree `Infra<S>` serves both stages: `S = SecretRef` as parsed,
//!   `S = Secret` once resolved. Resolution is a total map between the two.
//! - Provider kinds (pub/sub, metrics sinks, redis auth) are closed enums
//!   tagged by `type`
//! - Only the resolved tree is serializable; it is what services receive

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::secrets::{Secret, SecretRef};

/// The document as parsed, with unresolved indirections.
pub type InfraDocument = Infra<SecretRef>;

/// The document after every indirection was substituted.
pub type InfraConfig = Infra<Secret>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct Infra<S> {
    #[serde(default)]
    pub sql_servers: Vec<SqlServer<S>>,

    #[serde(default)]
    pub redis: BTreeMap<String, RedisServer<S>>,

    #[serde(default)]
    pub pubsub: Vec<PubSubProvider>,

    #[serde(default)]
    pub service_discovery: BTreeMap<String, DiscoveryEntry<S>>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig<S>>,

    #[serde(default)]
    pub graceful_shutdown: GracefulShutdown,

    /// Inter-service auth keys. The first key signs outgoing calls; all keys
    /// are accepted.
    #[serde(default)]
    pub auth: Vec<AuthKey<S>>,

    /// Application secrets by name.
    #[serde(default)]
    pub secrets: BTreeMap<String, S>,

    #[serde(default)]
    pub cors: CorsPolicy,

    /// Services run by this supervisor instance.
    #[serde(default)]
    pub hosted_services: Vec<String>,

    /// Gateways served by this supervisor instance.
    #[serde(default)]
    pub hosted_gateways: Vec<String>,
}

impl Default for InfraDocument {
    fn default() -> Self {
        Self {
            sql_servers: Vec::new(),
            redis: BTreeMap::new(),
            pubsub: Vec::new(),
            service_discovery: BTreeMap::new(),
            metrics: None,
            graceful_shutdown: GracefulShutdown::default(),
            auth: Vec::new(),
            secrets: BTreeMap::new(),
            cors: CorsPolicy::default(),
            hosted_services: Vec::new(),
            hosted_gateways: Vec::new(),
        }
    }
}

impl InfraDocument {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl InfraConfig {
    /// Look up an inter-service key by id and compare it with `key`.
    pub fn verify_service_key(&self, id: u32, key: &str) -> bool {
        self.auth
            .iter()
            .any(|k| k.id == id && k.key.matches(key))
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.graceful_shutdown.policy()
    }
}

/// A SQL server and the databases it hosts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct SqlServer<S> {
    pub host: String,
    #[serde(default)]
    pub tls: Option<SqlTls<S>>,
    #[serde(default)]
    pub databases: BTreeMap<String, SqlDatabase<S>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct SqlTls<S> {
    /// PEM encoded CA bundle used to verify the server.
    #[serde(default)]
    pub server_ca_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<ClientCert<S>>,
    #[serde(default)]
    pub disable_tls_hostname_verification: bool,
}

/// A client certificate (PEM) and its private key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientCert<S> {
    pub cert: String,
    pub key: S,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct SqlDatabase<S> {
    /// Name of the database on the server, if different from the logical name.
    #[serde(default)]
    pub name: Option<String>,
    pub username: String,
    pub password: S,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct RedisServer<S> {
    pub host: String,
    #[serde(default)]
    pub database_index: u32,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub tls: Option<RedisTls>,
    #[serde(default)]
    pub auth: Option<RedisAuth<S>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisTls {
    /// PEM encoded CA bundle; system roots are used when absent.
    #[serde(default)]
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RedisAuth<S> {
    Acl { username: String, password: S },
    AuthString { auth_string: S },
}

/// A message-queue provider with its topics.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PubSubProvider {
    GcpPubsub {
        project_id: String,
        #[serde(default)]
        topics: BTreeMap<String, Topic>,
    },
    AwsSnsSqs {
        #[serde(default)]
        topics: BTreeMap<String, Topic>,
    },
    AzureServiceBus {
        namespace: String,
        #[serde(default)]
        topics: BTreeMap<String, Topic>,
    },
    Nsq {
        hosts: Vec<String>,
        #[serde(default)]
        topics: BTreeMap<String, Topic>,
    },
}

impl PubSubProvider {
    pub fn topics(&self) -> &BTreeMap<String, Topic> {
        match self {
            PubSubProvider::GcpPubsub { topics, .. }
            | PubSubProvider::AwsSnsSqs { topics }
            | PubSubProvider::AzureServiceBus { topics, .. }
            | PubSubProvider::Nsq { topics, .. } => topics,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Topic {
    /// Provider-side name.
    pub name: String,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Subscription {
    pub name: String,
    #[serde(default)]
    pub push_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct DiscoveryEntry<S> {
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<AuthKey<S>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthKey<S> {
    pub id: u32,
    pub key: S,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig<S> {
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,
    #[serde(flatten)]
    pub sink: MetricsSink<S>,
}

fn default_collection_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsSink<S> {
    Prometheus {
        remote_write_url: S,
    },
    Datadog {
        site: String,
        api_key: S,
    },
    GcpCloudMonitoring {
        project_id: String,
        monitored_resource_type: String,
        #[serde(default)]
        monitored_resource_labels: BTreeMap<String, String>,
    },
    AwsCloudWatch {
        namespace: String,
    },
}

/// Largest accepted value for any shutdown deadline, in seconds.
pub const MAX_SHUTDOWN_SECS: u64 = 3600;

/// Graceful shutdown deadlines in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GracefulShutdown {
    pub total: u64,
    pub handlers: u64,
    pub shutdown_hooks: u64,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self {
            total: 30,
            handlers: 20,
            shutdown_hooks: 10,
        }
    }
}

impl GracefulShutdown {
    pub fn policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            total: Duration::from_secs(self.total),
            handlers: Duration::from_secs(self.handlers),
            hooks: Duration::from_secs(self.shutdown_hooks),
        }
    }
}

/// Deadlines driving the shutdown phases.
///
/// `handlers + hooks <= total` holds for every policy built from a resolved
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub total: Duration,
    pub handlers: Duration,
    pub hooks: Duration,
}

impl ShutdownPolicy {
    pub fn is_consistent(&self) -> bool {
        self.handlers
            .checked_add(self.hooks)
            .map_or(false, |sum| sum <= self.total)
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        GracefulShutdown::default().policy()
    }
}

/// CORS policy applied by the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsPolicy {
    /// Log why a cross-origin request was not allowed.
    pub debug: bool,

    /// Request headers allowed in addition to the ones routes declare.
    pub allow_headers: Vec<String>,

    /// Response headers exposed in addition to the ones routes declare.
    pub expose_headers: Vec<String>,

    /// Origins allowed for requests without credentials. `*` allows all.
    pub allow_origins_without_credentials: Vec<String>,

    /// Origins allowed for requests carrying cookies or an Authorization header.
    pub allow_origins_with_credentials: Vec<String>,

    /// Answer private network access preflights.
    pub allow_private_network_access: bool,

    pub max_age_secs: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            debug: false,
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_origins_without_credentials: vec!["*".to_string()],
            allow_origins_with_credentials: Vec::new(),
            allow_private_network_access: false,
            max_age_secs: 7200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "sql_servers": [{
            "host": "db.internal:5432",
            "databases": {
                "main": { "username": "app", "password": {"$env": "DB_PASSWORD"} }
            }
        }],
        "redis": {
            "cache": {
                "host": "redis.internal:6379",
                "key_prefix": "app:",
                "auth": { "type": "acl", "username": "app", "password": {"$env": "REDIS_PASSWORD"} }
            }
        },
        "pubsub": [{
            "type": "nsq",
            "hosts": ["nsq.internal:4150"],
            "topics": {
                "signups": {
                    "name": "signups",
                    "subscriptions": { "welcome-email": { "name": "welcome-email" } }
                }
            }
        }],
        "metrics": { "type": "datadog", "site": "datadoghq.eu", "api_key": {"$env": "DD_KEY"} },
        "graceful_shutdown": { "total": 30, "handlers": 20, "shutdown_hooks": 10 },
        "auth": [{ "id": 1, "key": {"$env": "SVC_KEY"} }],
        "secrets": { "StripeKey": {"$env": "STRIPE_KEY"} },
        "hosted_services": ["blog"],
        "hosted_gateways": ["api-gateway"]
    }"#;

    #[test]
    fn parses_document() {
        let doc = InfraDocument::from_json(DOC).unwrap();
        assert_eq!(doc.sql_servers[0].databases["main"].password, SecretRef::env("DB_PASSWORD"));
        assert!(matches!(
            doc.redis["cache"].auth,
            Some(RedisAuth::Acl { .. })
        ));
        assert_eq!(doc.pubsub[0].topics()["signups"].subscriptions.len(), 1);
        let metrics = doc.metrics.as_ref().unwrap();
        assert_eq!(metrics.collection_interval_secs, 60);
        assert!(matches!(metrics.sink, MetricsSink::Datadog { .. }));
        assert!(doc.graceful_shutdown.policy().is_consistent());
        assert_eq!(doc.cors.allow_origins_without_credentials, vec!["*"]);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = InfraDocument::from_json(r#"{"pubsub": [{"type": "kafka"}]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn inconsistent_policy() {
        let policy = GracefulShutdown {
            total: 10,
            handlers: 8,
            shutdown_hooks: 5,
        }
        .policy();
        assert!(!policy.is_consistent());
    }

    #[test]
    fn overflowing_policy_is_inconsistent() {
        let policy = GracefulShutdown {
            total: 30,
            handlers: u64::MAX,
            shutdown_hooks: 10,
        }
        .policy();
        assert!(!policy.is_consistent());
    }

    #[test]
    fn parses_nested_indirections() {
        let doc = InfraDocument::from_json(
            r#"{
                "sql_servers": [{
                    "host": "db:5432",
                    "tls": {"client_cert": {"cert": "PEM", "key": {"$env": "DB_CLIENT_KEY"}}}
                }],
                "service_discovery": {
                    "billing": {"base_url": "http://billing", "auth": {"id": 2, "key": {"$env": "BILLING_KEY"}}}
                }
            }"#,
        )
        .unwrap();
        let tls = doc.sql_servers[0].tls.as_ref().unwrap();
        assert_eq!(tls.client_cert.as_ref().unwrap().key, SecretRef::env("DB_CLIENT_KEY"));
        let auth = doc.service_discovery["billing"].auth.as_ref().unwrap();
        assert_eq!(auth.key, SecretRef::env("BILLING_KEY"));
    }
}
