//! Spawning and signalling service processes.

use std::net::{SocketAddr, TcpListener};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::config::distribute::RuntimeEnvironment;
use crate::config::schema::ServiceConfig;
use crate::observability::logging::SERVICE_TARGET;
use crate::supervisor::SupervisorError;

/// Reserve a private loopback address for a replica slot.
///
/// The port is released again before the process binds it; the slot keeps
/// the address for its whole life so restarts never collide.
pub fn allocate_address() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.local_addr()
}

/// Launch one replica with its distributed environment.
///
/// The parent environment is inherited; the service's own `env` and the
/// runtime variables are layered on top.
pub fn spawn(
    service: &ServiceConfig,
    replica: u32,
    env: &RuntimeEnvironment,
) -> Result<Child, SupervisorError> {
    let mut command = Command::new(&service.command);
    command
        .args(&service.args)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &service.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        service: service.name.clone(),
        source,
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, service.name.clone(), replica, Stream::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, service.name.clone(), replica, Stream::Stderr));
    }
    Ok(child)
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_lines<R>(reader: R, service: String, replica: u32, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                Stream::Stdout => tracing::info!(target: SERVICE_TARGET, service = %service, replica, "{}", line),
                Stream::Stderr => tracing::warn!(target: SERVICE_TARGET, service = %service, replica, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(service = %service, replica, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// Send `sig` to the child. A child that was already reaped is not an error.
pub fn send_signal(child: &Child, sig: Signal) -> Result<(), SupervisorError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_distinct_addresses() {
        let a = allocate_address().unwrap();
        let b = allocate_address().unwrap();
        assert!(a.ip().is_loopback());
        assert_ne!(a.port(), 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let service = ServiceConfig {
            name: "ghost".into(),
            command: "/nonexistent/fleetd-test-binary".into(),
            ..ServiceConfig::default()
        };
        let env = test_env(&service);
        let err = spawn(&service, 0, &env).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_environment_reaches_process() {
        let service = ServiceConfig {
            name: "echo".into(),
            command: "sh".into(),
            args: vec!["-c".into(), "test \"$FLEET_SERVICE_NAME\" = echo && test -n \"$PORT\"".into()],
            ..ServiceConfig::default()
        };
        let env = test_env(&service);
        let mut child = spawn(&service, 0, &env).unwrap();
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_sigterm() {
        let service = ServiceConfig {
            name: "sleeper".into(),
            command: "sleep".into(),
            args: vec!["30".into()],
            ..ServiceConfig::default()
        };
        let env = test_env(&service);
        let mut child = spawn(&service, 0, &env).unwrap();
        send_signal(&child, Signal::SIGTERM).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        // Already reaped.
        send_signal(&child, Signal::SIGKILL).unwrap();
    }

    fn test_env(service: &ServiceConfig) -> RuntimeEnvironment {
        let infra = crate::config::resolve::resolve(
            &crate::config::InfraDocument::default(),
            &std::collections::HashMap::<String, String>::new(),
        )
        .unwrap();
        RuntimeEnvironment::for_replica(
            service,
            0,
            allocate_address().unwrap(),
            &crate::config::GatewayConfig::default(),
            &infra,
            &Default::default(),
        )
        .unwrap()
    }
}
