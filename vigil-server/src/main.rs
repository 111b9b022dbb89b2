//! Vigil controller binary.
//!
//! Loads the layered TOML configuration, spawns one monitor per cluster
//! plus the peer heartbeat loop, and serves the heartbeat/status API.
//! Vendor database and proxy drivers are deployment-specific; this build
//! runs the in-memory scripted fleet so the control plane can be
//! exercised end to end.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil_server::heartbeat;
use vigil_server::simulation;
use vigil_server::Supervisor;

/// Vigil - supervisory controller for replicated database clusters
#[derive(Parser)]
#[command(
    name = "vigil-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Supervisory controller for replicated MariaDB/MySQL cluster fleets"
)]
struct Args {
    /// Path to the controller configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/vigil/vigil.toml")]
    config: PathBuf,

    /// Optional saved-overrides file (the `saved` config layer)
    #[arg(long, value_name = "FILE")]
    saved: Option<PathBuf>,

    /// Config overrides applied to every cluster, `key=value`, repeatable
    #[arg(short = 'o', long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = match vigil_server::load_settings(
        &args.config,
        args.saved.as_deref(),
        &args.overrides,
    ) {
        Ok(settings) => settings,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Supervisor::new(settings.supervisor);
    info!("controller {} starting", supervisor.uuid);

    for cluster in settings.clusters {
        let fleet = simulation::scripted_fleet_for(&cluster);
        let proxies = simulation::scripted_proxies_for(&cluster);
        // A rejected cluster stays out of the registry with its terminal
        // event; the process keeps serving the healthy ones.
        if let Err(e) = supervisor.add_cluster(cluster, fleet, proxies).await {
            error!("cluster skipped: {e}");
        }
    }

    tokio::spawn(Arc::clone(&supervisor).run_heartbeat_loop());

    let serving = heartbeat::serve(Arc::clone(&supervisor));
    tokio::select! {
        result = serving => {
            if let Err(e) = result {
                error!("api server failed: {e}");
                supervisor.stop().await;
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    supervisor.stop().await;
    ExitCode::SUCCESS
}
