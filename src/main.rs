//! fleetd
//!
//! Starts every configured service, routes gateway traffic to them and
//! shuts the fleet down in phases on SIGTERM/SIGINT.

use std::path::PathBuf;

use clap::Parser;

use fleetd::config::{load_resolved, ProcessEnv};
use fleetd::lifecycle::signals::ShutdownSignals;
use fleetd::lifecycle::startup::{build_route_table, prepare};
use fleetd::observability::logging;

#[derive(Parser)]
#[command(name = "fleetd", version, about = "Process supervisor and API gateway")]
struct Args {
    /// Fleet configuration file
    #[arg(short, long, env = "FLEETD_CONFIG", default_value = "fleetd.toml")]
    config: PathBuf,

    /// Validate the configuration and route schemas, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let resolved = match load_resolved(&args.config, &ProcessEnv) {
        Ok(resolved) => resolved,
        Err(e) if !e.field_errors().is_empty() => {
            eprintln!("{}: invalid configuration", args.config.display());
            for error in e.field_errors() {
                eprintln!("  - {}", error);
            }
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    if args.check {
        let routes = build_route_table(&resolved.fleet.services)?;
        println!(
            "{}: ok ({} services, {} routes)",
            args.config.display(),
            resolved.fleet.services.len(),
            routes.routes().len()
        );
        return Ok(());
    }

    logging::init(&resolved.fleet.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "fleetd starting");

    // Installed before anything is spawned so an early signal is not lost.
    let signals = ShutdownSignals::install()?;

    let prepared = prepare(resolved).await?;
    let fleet = prepared.launch()?;
    let report = fleet.run_until_signal(signals).await;

    if report.forced_kill {
        tracing::warn!(elapsed_ms = report.total.as_millis() as u64, "Shutdown required SIGKILL");
        std::process::exit(1);
    }
    Ok(())
}
