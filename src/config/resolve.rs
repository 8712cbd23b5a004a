//! Secret resolution and cross-document checks.
//!
//! # Data Flow
//! ```text
//! InfraDocument (SecretRef)  +  EnvSource
//!     → Resolver walks every field, substituting `$env` indirections
//!     → PEM material and URLs are checked on the way
//!     → every failure is recorded with its field path
//!     → errors.is_empty() ? InfraConfig (Secret) : Err(all errors)
//! ```
//!
//! # Design Decisions
//! - All-or-nothing: a tree with a failed field is never returned
//! - The walk does not stop at the first error so operators see every
//!   problem in one run

use std::collections::BTreeMap;

use crate::config::infra::{
    AuthKey, ClientCert, DiscoveryEntry, Infra, InfraConfig, InfraDocument, MetricsConfig,
    MetricsSink, RedisAuth, RedisServer, SqlDatabase, SqlServer, SqlTls, MAX_SHUTDOWN_SECS,
};
use crate::config::schema::FleetConfig;
use crate::config::secrets::{resolve_secret, EnvSource, Secret, SecretRef};
use crate::config::validation::{FieldPath, ValidationError};
use crate::net::tls::{validate_certificates, validate_listener_files, validate_private_key};

/// Supervisor configuration and infrastructure document, fully resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub fleet: FleetConfig,
    pub infra: InfraConfig,
    pub admin_key: Option<Secret>,
}

impl ResolvedConfig {
    /// Names of the services this instance runs.
    pub fn hosted_services(&self) -> Vec<&str> {
        self.fleet.services.iter().map(|s| s.name.as_str()).collect()
    }
}

struct Resolver<'a> {
    env: &'a dyn EnvSource,
    errors: Vec<ValidationError>,
}

impl<'a> Resolver<'a> {
    fn new(env: &'a dyn EnvSource) -> Self {
        Self {
            env,
            errors: Vec::new(),
        }
    }

    fn secret(&mut self, path: &FieldPath, reference: &SecretRef) -> Secret {
        match resolve_secret(reference, self.env) {
            Ok(secret) => secret,
            Err(e) => {
                self.errors.push(path.error(e.to_string()));
                // Placeholder; the tree is discarded when any error was recorded.
                Secret::new(String::new())
            }
        }
    }

    fn certificates(&mut self, path: &FieldPath, pem: &str) {
        if let Err(e) = validate_certificates(pem) {
            self.errors.push(path.error(e));
        }
    }

    fn private_key(&mut self, path: &FieldPath, pem: &Secret) {
        if pem.expose().is_empty() {
            return;
        }
        if let Err(e) = validate_private_key(pem.expose()) {
            self.errors.push(path.error(e));
        }
    }

    fn url(&mut self, path: &FieldPath, value: &str) {
        match url::Url::parse(value) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            Ok(u) => self
                .errors
                .push(path.error(format!("unsupported scheme '{}'", u.scheme()))),
            Err(e) => self.errors.push(path.error(format!("invalid URL: {}", e))),
        }
    }

    fn auth_key(&mut self, path: &FieldPath, key: &AuthKey<SecretRef>) -> AuthKey<Secret> {
        AuthKey {
            id: key.id,
            key: self.secret(&path.key("key"), &key.key),
        }
    }

    fn sql_server(&mut self, path: &FieldPath, server: &SqlServer<SecretRef>) -> SqlServer<Secret> {
        if server.host.trim().is_empty() {
            self.errors.push(path.key("host").error("must not be empty"));
        }
        let tls = server.tls.as_ref().map(|tls| {
            let tls_path = path.key("tls");
            if let Some(ca) = &tls.server_ca_cert {
                self.certificates(&tls_path.key("server_ca_cert"), ca);
            }
            let client_cert = tls.client_cert.as_ref().map(|cc| {
                let cc_path = tls_path.key("client_cert");
                self.certificates(&cc_path.key("cert"), &cc.cert);
                let key = self.secret(&cc_path.key("key"), &cc.key);
                self.private_key(&cc_path.key("key"), &key);
                ClientCert {
                    cert: cc.cert.clone(),
                    key,
                }
            });
            SqlTls {
                server_ca_cert: tls.server_ca_cert.clone(),
                client_cert,
                disable_tls_hostname_verification: tls.disable_tls_hostname_verification,
            }
        });
        let databases = server
            .databases
            .iter()
            .map(|(name, db)| {
                let db_path = path.key("databases").key(name);
                let resolved = SqlDatabase {
                    name: db.name.clone(),
                    username: db.username.clone(),
                    password: self.secret(&db_path.key("password"), &db.password),
                    max_connections: db.max_connections,
                    min_connections: db.min_connections,
                };
                if let (Some(min), Some(max)) = (db.min_connections, db.max_connections) {
                    if min > max {
                        self.errors
                            .push(db_path.key("min_connections").error("must be <= max_connections"));
                    }
                }
                (name.clone(), resolved)
            })
            .collect();
        SqlServer {
            host: server.host.clone(),
            tls,
            databases,
        }
    }

    fn redis(&mut self, path: &FieldPath, server: &RedisServer<SecretRef>) -> RedisServer<Secret> {
        if let Some(ca) = server.tls.as_ref().and_then(|t| t.ca.as_ref()) {
            self.certificates(&path.key("tls").key("ca"), ca);
        }
        let auth = server.auth.as_ref().map(|auth| match auth {
            RedisAuth::Acl { username, password } => RedisAuth::Acl {
                username: username.clone(),
                password: self.secret(&path.key("auth").key("password"), password),
            },
            RedisAuth::AuthString { auth_string } => RedisAuth::AuthString {
                auth_string: self.secret(&path.key("auth").key("auth_string"), auth_string),
            },
        });
        RedisServer {
            host: server.host.clone(),
            database_index: server.database_index,
            key_prefix: server.key_prefix.clone(),
            tls: server.tls.clone(),
            auth,
        }
    }

    fn metrics(&mut self, path: &FieldPath, metrics: &MetricsConfig<SecretRef>) -> MetricsConfig<Secret> {
        if metrics.collection_interval_secs == 0 {
            self.errors
                .push(path.key("collection_interval_secs").error("must be greater than zero"));
        }
        let sink = match &metrics.sink {
            MetricsSink::Prometheus { remote_write_url } => {
                let url = self.secret(&path.key("remote_write_url"), remote_write_url);
                if !url.expose().is_empty() {
                    self.url(&path.key("remote_write_url"), url.expose());
                }
                MetricsSink::Prometheus {
                    remote_write_url: url,
                }
            }
            MetricsSink::Datadog { site, api_key } => MetricsSink::Datadog {
                site: site.clone(),
                api_key: self.secret(&path.key("api_key"), api_key),
            },
            MetricsSink::GcpCloudMonitoring {
                project_id,
                monitored_resource_type,
                monitored_resource_labels,
            } => MetricsSink::GcpCloudMonitoring {
                project_id: project_id.clone(),
                monitored_resource_type: monitored_resource_type.clone(),
                monitored_resource_labels: monitored_resource_labels.clone(),
            },
            MetricsSink::AwsCloudWatch { namespace } => MetricsSink::AwsCloudWatch {
                namespace: namespace.clone(),
            },
        };
        MetricsConfig {
            collection_interval_secs: metrics.collection_interval_secs,
            sink,
        }
    }

    fn finish<T>(self, value: T) -> Result<T, Vec<ValidationError>> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self.errors)
        }
    }
}

/// Substitute every indirection in `doc` from `env`.
///
/// Fails closed: any unresolved or literal secret, malformed PEM block, bad
/// URL or inconsistent deadline fails the whole document.
pub fn resolve(doc: &InfraDocument, env: &dyn EnvSource) -> Result<InfraConfig, Vec<ValidationError>> {
    let mut r = Resolver::new(env);

    let sql_servers = doc
        .sql_servers
        .iter()
        .enumerate()
        .map(|(i, s)| r.sql_server(&FieldPath::root("sql_servers").index(i), s))
        .collect();

    let redis = doc
        .redis
        .iter()
        .map(|(name, s)| (name.clone(), r.redis(&FieldPath::root("redis").key(name), s)))
        .collect();

    let service_discovery: BTreeMap<_, _> = doc
        .service_discovery
        .iter()
        .map(|(name, entry)| {
            let path = FieldPath::root("service_discovery").key(name);
            r.url(&path.key("base_url"), &entry.base_url);
            let auth = entry.auth.as_ref().map(|k| r.auth_key(&path.key("auth"), k));
            (
                name.clone(),
                DiscoveryEntry {
                    base_url: entry.base_url.clone(),
                    auth,
                },
            )
        })
        .collect();

    let metrics = doc
        .metrics
        .as_ref()
        .map(|m| r.metrics(&FieldPath::root("metrics"), m));

    let gs = FieldPath::root("graceful_shutdown");
    let deadlines = [
        ("total", doc.graceful_shutdown.total),
        ("handlers", doc.graceful_shutdown.handlers),
        ("shutdown_hooks", doc.graceful_shutdown.shutdown_hooks),
    ];
    for (field, secs) in deadlines {
        if secs > MAX_SHUTDOWN_SECS {
            r.errors.push(gs.key(field).error(format!("must be at most {}s", MAX_SHUTDOWN_SECS)));
        }
    }
    if !doc.graceful_shutdown.policy().is_consistent() {
        r.errors.push(gs.error(format!(
            "handlers ({}s) + shutdown_hooks ({}s) exceed total ({}s)",
            doc.graceful_shutdown.handlers,
            doc.graceful_shutdown.shutdown_hooks,
            doc.graceful_shutdown.total
        )));
    }

    let mut seen_ids = std::collections::HashSet::new();
    let auth = doc
        .auth
        .iter()
        .enumerate()
        .map(|(i, k)| {
            let path = FieldPath::root("auth").index(i);
            if !seen_ids.insert(k.id) {
                r.errors.push(path.key("id").error(format!("duplicate key id {}", k.id)));
            }
            r.auth_key(&path, k)
        })
        .collect();

    let secrets = doc
        .secrets
        .iter()
        .map(|(name, s)| (name.clone(), r.secret(&FieldPath::root("secrets").key(name), s)))
        .collect();

    let resolved = Infra {
        sql_servers,
        redis,
        pubsub: doc.pubsub.clone(),
        service_discovery,
        metrics,
        graceful_shutdown: doc.graceful_shutdown,
        auth,
        secrets,
        cors: doc.cors.clone(),
        hosted_services: doc.hosted_services.clone(),
        hosted_gateways: doc.hosted_gateways.clone(),
    };

    r.finish(resolved)
}

/// Resolve the infrastructure document and check it against the supervisor
/// configuration.
pub fn resolve_all(
    fleet: FleetConfig,
    doc: &InfraDocument,
    env: &dyn EnvSource,
) -> Result<ResolvedConfig, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let infra = match resolve(doc, env) {
        Ok(infra) => Some(infra),
        Err(mut e) => {
            errors.append(&mut e);
            None
        }
    };

    for (i, name) in doc.hosted_services.iter().enumerate() {
        if fleet.service(name).is_none() {
            errors.push(
                FieldPath::root("hosted_services")
                    .index(i)
                    .error(format!("no service named '{}' is configured", name)),
            );
        }
    }
    if !doc.hosted_gateways.is_empty() && !doc.hosted_gateways.contains(&fleet.gateway.name) {
        errors.push(FieldPath::root("hosted_gateways").error(format!(
            "gateway '{}' is not listed",
            fleet.gateway.name
        )));
    }

    for (i, listener) in fleet.gateway.listeners.iter().enumerate() {
        if let Some(tls) = &listener.tls {
            if let Err(e) = validate_listener_files(&tls.cert_path, &tls.key_path) {
                errors.push(FieldPath::root("gateway").key("listeners").index(i).key("tls").error(e));
            }
        }
    }

    let admin_key = match (&fleet.admin.api_key, fleet.admin.enabled) {
        (Some(reference), true) => match resolve_secret(reference, env) {
            Ok(secret) => Some(secret),
            Err(e) => {
                errors.push(FieldPath::root("admin").key("api_key").error(e.to_string()));
                None
            }
        },
        _ => None,
    };

    match infra {
        Some(infra) if errors.is_empty() => Ok(ResolvedConfig {
            fleet,
            infra,
            admin_key,
        }),
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ServiceConfig;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn doc(json: &str) -> InfraDocument {
        InfraDocument::from_json(json).unwrap()
    }

    #[test]
    fn resolves_every_secret() {
        let d = doc(r#"{
            "sql_servers": [{"host": "db:5432", "databases": {
                "main": {"username": "app", "password": {"$env": "DB_PW"}}
            }}],
            "auth": [{"id": 7, "key": {"$env": "SVC_KEY"}}],
            "secrets": {"Stripe": {"$env": "STRIPE"}}
        }"#);
        let e = env(&[("DB_PW", "pw"), ("SVC_KEY", "k"), ("STRIPE", "sk_live")]);

        let infra = resolve(&d, &e).unwrap();
        assert_eq!(infra.sql_servers[0].databases["main"].password.expose(), "pw");
        assert_eq!(infra.secrets["Stripe"].expose(), "sk_live");
        assert!(infra.verify_service_key(7, "k"));
        assert!(!infra.verify_service_key(7, "nope"));
        assert!(!infra.verify_service_key(8, "k"));
    }

    #[test]
    fn collects_all_errors_with_paths() {
        let d = doc(r#"{
            "sql_servers": [{"host": "db:5432", "databases": {
                "main": {"username": "app", "password": {"$env": "DB_PW"}}
            }}],
            "secrets": {"A": "literal-value", "B": {"$env": "EMPTY"}},
            "service_discovery": {"blog": {"base_url": "not a url"}},
            "graceful_shutdown": {"total": 10, "handlers": 8, "shutdown_hooks": 5}
        }"#);
        let e = env(&[("EMPTY", "")]);

        let errors = resolve(&d, &e).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "sql_servers[0].databases.main.password",
                "service_discovery.blog.base_url",
                "graceful_shutdown",
                "secrets.A",
                "secrets.B",
            ]
        );
    }

    #[test]
    fn rejects_out_of_range_deadlines() {
        let d = doc(r#"{"graceful_shutdown": {"total": 30, "handlers": 18446744073709551615, "shutdown_hooks": 10}}"#);
        let errors = resolve(&d, &env(&[])).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["graceful_shutdown.handlers", "graceful_shutdown"]);

        let d = doc(r#"{"graceful_shutdown": {"total": 18446744073709551615, "handlers": 0, "shutdown_hooks": 0}}"#);
        let errors = resolve(&d, &env(&[])).unwrap_err();
        assert_eq!(errors[0].path, "graceful_shutdown.total");
    }

    #[test]
    fn rejects_malformed_pem() {
        let d = doc(r#"{
            "sql_servers": [{"host": "db:5432", "tls": {"server_ca_cert": "garbage"}}],
            "redis": {"cache": {"host": "r:6379", "tls": {"ca": "garbage"}}}
        }"#);
        let errors = resolve(&d, &env(&[])).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"sql_servers[0].tls.server_ca_cert"));
        assert!(paths.contains(&"redis.cache.tls.ca"));
    }

    #[test]
    fn hosted_services_must_be_configured() {
        let mut fleet = FleetConfig::default();
        fleet.services.push(ServiceConfig {
            name: "blog".into(),
            command: "./blog".into(),
            ..Default::default()
        });
        let d = doc(r#"{"hosted_services": ["blog", "billing"], "hosted_gateways": ["api-gateway"]}"#);

        let errors = resolve_all(fleet, &d, &env(&[])).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "hosted_services[1]");
    }
}
