// CLI entry point: load files, project the requested resource, reconcile,
// persist state.
use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::fmt::format::FmtSpan;

use keel::config::Deployment;
use keel::docker::DockerProvider;

#[derive(Parser, Debug)]
#[command(
    name = "keel",
    about = "Deploys self-hosted Kubernetes control planes over remote container runtimes",
    version
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the state file.
    #[arg(long, default_value = "state.yaml")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy the configured etcd cluster.
    Etcd,
    /// Deploy the configured static controlplane.
    Controlplane,
    /// Deploy the given kubelet pool.
    KubeletPool { name: String },
    /// Deploy the given API load balancer pool.
    #[command(name = "apiloadbalancer-pool")]
    ApiLoadBalancerPool { name: String },
    /// Generate the configured PKI.
    Pki,
    /// Print the admin kubeconfig to standard output.
    Kubeconfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,keel=debug".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    if let Err(err) = run(cli).await {
        error!("{err}");

        let mut source = err.source();
        while let Some(cause) = source {
            error!("  caused by: {cause}");
            source = cause.source();
        }

        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> keel::config::Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting pending actions");
            interrupt.cancel();
        }
    });

    let mut deployment = Deployment::load(&cli.config, &cli.state).await?;
    let provider = DockerProvider::new(cancel.clone());

    match cli.command {
        Command::Etcd => deployment.run_etcd(&provider, &cancel).await,
        Command::Controlplane => deployment.run_controlplane(&provider, &cancel).await,
        Command::KubeletPool { name } => {
            deployment.run_kubelet_pool(&name, &provider, &cancel).await
        }
        Command::ApiLoadBalancerPool { name } => {
            deployment
                .run_api_load_balancer_pool(&name, &provider, &cancel)
                .await
        }
        Command::Pki => deployment.run_pki().await,
        Command::Kubeconfig => {
            print!("{}", deployment.kubeconfig()?);
            Ok(())
        }
    }
}
