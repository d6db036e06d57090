use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use suss::cluster::KubeCluster;
use suss::coordinator::{CoordinatorConfig, MaintenanceCoordinator};
use suss::rest_api::{self, ApiState};
use suss::telemetry::{self, LogBroadcast};
use suss::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node maintenance service
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Address the HTTP command API listens on
    #[arg(long, env = "BIND_ADDRESS", default_value = rest_api::DEFAULT_BIND_ADDRESS)]
    bind_address: String,

    /// Path to a kubeconfig file; the in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Name of the node this instance manages
    #[arg(long, env = "NODENAME")]
    nodename: String,

    /// Namespace holding the maintenance lease
    #[arg(long, env = "NAMESPACE")]
    lease_namespace: String,

    /// Treat pods owned by a StatefulSet as critical
    #[arg(long, env = "CONSIDER_STATEFULSET_CRITICAL")]
    consider_statefulset_critical: bool,

    /// Treat pods of a ReplicaSet with a single desired replica as critical
    #[arg(long, env = "CONSIDER_SOLE_REPLICAS_CRITICAL")]
    consider_sole_replicas_critical: bool,

    /// Log as JSON instead of plain text
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("suss v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    let logs = LogBroadcast::new();
    telemetry::init_tracing(args.log_json, &logs);

    info!("Starting suss v{}", env!("CARGO_PKG_VERSION"));

    let cluster = KubeCluster::connect(args.kubeconfig.as_deref()).await?;
    info!("Connected to Kubernetes cluster");

    let mut config = CoordinatorConfig::new(args.nodename, args.lease_namespace);
    config.policy.consider_statefulset_critical = args.consider_statefulset_critical;
    config.policy.consider_sole_replicas_critical = args.consider_sole_replicas_critical;

    let coordinator = MaintenanceCoordinator::new(config, Arc::new(cluster));
    coordinator.start().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let state = Arc::new(ApiState {
        coordinator: Arc::new(coordinator),
        shutdown,
        logs,
    });
    rest_api::run_server(state, &args.bind_address).await?;

    info!("Shut down");
    Ok(())
}
