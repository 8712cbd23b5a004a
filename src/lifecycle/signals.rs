//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate signals to shutdown events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The first SIGTERM/SIGINT starts a graceful shutdown
//! - A second one forces it

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
}

impl ShutdownSignals {
    /// Install the handlers. Done before anything is started, so a signal
    /// arriving during startup is not lost.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next termination signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }

    /// Cancel `force` when another signal arrives.
    pub fn force_on_next(mut self, force: CancellationToken) {
        tokio::spawn(async move {
            tokio::select! {
                name = self.recv() => {
                    tracing::warn!(signal = name, "Second signal received, forcing shutdown");
                    force.cancel();
                }
                _ = force.cancelled() => {}
            }
        });
    }
}
