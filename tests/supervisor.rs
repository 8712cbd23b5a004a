//! End-to-end tests: configuration file to running processes and back.

use std::collections::HashMap;
use std::time::Duration;

use fleetd::config::load_resolved;
use fleetd::lifecycle::prepare;
use fleetd::supervisor::ProcessState;
use serde_json::Value;

mod common;
use common::*;

fn fleet_toml(out_dir: &std::path::Path, script: &str) -> String {
    format!(
        r#"
[gateway]
name = "api"
listeners = [{{ bind_address = "127.0.0.1:0" }}]

[readiness]
probe = "none"

[health_check]
enabled = false

[restart]
base_delay_ms = 10
max_delay_ms = 50

[admin]
enabled = true
bind_address = "127.0.0.1:0"
api_key = {{ "$env" = "ADMIN_KEY" }}

[[services]]
name = "worker"
command = "sh"
args = ["-c", '{script}']
replicas = 2
env = {{ OUT_DIR = "{out}" }}
"#,
        script = script,
        out = out_dir.display()
    )
}

fn env() -> HashMap<String, String> {
    HashMap::from([("ADMIN_KEY".to_string(), "letmein".to_string())])
}

async fn wait_for_file(path: &std::path::Path) -> String {
    for _ in 0..200 {
        if let Ok(content) = std::fs::read_to_string(path) {
            if content.ends_with('\n') {
                return content;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} was never written", path.display());
}

#[tokio::test]
async fn test_fleet_starts_distributes_config_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"echo "$FLEET_SERVICE_NAME $FLEET_REPLICA $PORT" > "$OUT_DIR/$FLEET_REPLICA.txt"; exec sleep 30"#;
    let path = write_file(dir.path(), "fleetd.toml", &fleet_toml(dir.path(), script));

    let resolved = load_resolved(&path, &env()).unwrap();
    let prepared = prepare(resolved).await.unwrap();
    let admin = prepared.admin_addr().unwrap();
    let fleet = prepared.launch().unwrap();
    fleet.supervisor().wait_started().await;

    // Each replica sees its own identity and port.
    let first = wait_for_file(&dir.path().join("0.txt")).await;
    let second = wait_for_file(&dir.path().join("1.txt")).await;
    assert!(first.starts_with("worker 0 "));
    assert!(second.starts_with("worker 1 "));
    assert_ne!(first.split_whitespace().last(), second.split_whitespace().last());
    assert_eq!(fleet.registry().resolve("worker").len(), 2);

    // Admin API.
    let http = client();
    let res = http.get(format!("http://{}/admin/status", admin)).send().await.unwrap();
    assert_eq!(res.status(), 401);
    let status: Value = http
        .get(format!("http://{}/admin/status", admin))
        .bearer_auth("letmein")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "operational");
    assert_eq!(status["replicas_ready"], 2);

    let replicas = fleet.supervisor().replicas();
    let coordinator = fleet.coordinator();
    let report = fleet.shutdown(coordinator).await;

    assert!(!report.forced_kill);
    assert!(replicas.iter().all(|r| r.state() == ProcessState::Terminated));
}

#[tokio::test]
async fn test_missing_admin_key_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "fleetd.toml", &fleet_toml(dir.path(), "exec sleep 30"));

    let err = load_resolved(&path, &HashMap::<String, String>::new()).unwrap_err();
    assert!(err
        .field_errors()
        .iter()
        .any(|e| e.path == "admin.api_key"));
}

#[tokio::test]
async fn test_crashing_service_is_reported_failed() {
    let dir = tempfile::tempdir().unwrap();
    let toml = fleet_toml(dir.path(), "exit 1").replace(
        "max_delay_ms = 50",
        "max_delay_ms = 50\nmax_consecutive_failures = 1",
    );
    let path = write_file(dir.path(), "fleetd.toml", &toml);

    let resolved = load_resolved(&path, &env()).unwrap();
    let prepared = prepare(resolved).await.unwrap();
    let admin = prepared.admin_addr().unwrap();
    let fleet = prepared.launch().unwrap();
    for replica in fleet.supervisor().replicas() {
        assert_eq!(replica.observe().await.state, ProcessState::Failed);
    }

    assert!(fleet.registry().is_failed("worker"));
    let status: Value = client()
        .get(format!("http://{}/admin/status", admin))
        .bearer_auth("letmein")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "degraded");

    let coordinator = fleet.coordinator();
    let report = fleet.shutdown(coordinator).await;
    assert!(!report.forced_kill);
}
