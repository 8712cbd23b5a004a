//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use fleetd::config::resolve::resolve;
use fleetd::config::schema::{GatewayConfig, HealthCheckConfig, ListenerConfig};
use fleetd::config::{InfraConfig, InfraDocument};
use fleetd::http::{Gateway, GatewayHandle, GatewayState};
use fleetd::registry::ServiceRegistry;
use fleetd::routing::{RouteTable, ServiceSchema};

/// Serve `app` on an ephemeral loopback port.
pub async fn start_backend(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A loopback address nothing listens on.
pub fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Resolve an infrastructure document against a fixed environment.
pub fn infra(json: &str, env: &[(&str, &str)]) -> InfraConfig {
    let doc = InfraDocument::from_json(json).unwrap();
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    resolve(&doc, &env).unwrap()
}

pub fn route_table(schemas: &[&str]) -> RouteTable {
    let mut table = RouteTable::new();
    for schema in schemas {
        table.add_schema(&ServiceSchema::from_json(schema).unwrap()).unwrap();
    }
    table
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub registry: Arc<ServiceRegistry>,
    pub handle: GatewayHandle,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve a gateway on an ephemeral port with the given routes.
pub async fn start_gateway(routes: RouteTable, infra: InfraConfig) -> TestGateway {
    let config = GatewayConfig {
        listeners: vec![ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            tls: None,
        }],
        request_timeout_secs: 5,
        connect_timeout_secs: 1,
        ..GatewayConfig::default()
    };
    let registry = Arc::new(ServiceRegistry::default());
    let state = GatewayState::new(
        config.clone(),
        HealthCheckConfig::default(),
        routes,
        registry.clone(),
        Arc::new(infra),
    );
    let gateway = Gateway::bind(state, &config.listeners).await.unwrap();
    let addr = gateway.local_addrs()[0];
    TestGateway {
        addr,
        registry,
        handle: gateway.serve(),
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
