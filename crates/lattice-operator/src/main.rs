//! Lattice VolumeAutoscaler operator binary

use clap::Parser;

use lattice_common::kube_utils::create_client;
use lattice_common::telemetry::{init_telemetry, TelemetryConfig};
use lattice_operator::config::Cli;
use lattice_operator::controller_runner::{build_volume_autoscaler_controller, RunnerOptions};
use lattice_operator::startup::{cancel_on_signal, crd_yaml, ensure_crds};
use tokio_util::sync::CancellationToken;

const SERVICE_NAME: &str = "lattice-volume-autoscaler";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("CRITICAL: Failed to install rustls crypto provider");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_yaml()?);
        return Ok(());
    }

    if let Err(msg) = cli.validate() {
        eprintln!("error: {msg}");
        std::process::exit(2);
    }

    let mut telemetry = TelemetryConfig::from_env(SERVICE_NAME);
    telemetry.json_logs = !cli.text_logs;
    let guard = init_telemetry(telemetry)
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    let result = run(cli).await;
    if let Err(ref e) = result {
        tracing::error!(error = %e, "Operator exited with error");
    }

    guard.shutdown();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Lattice VolumeAutoscaler");

    let client = create_client()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if cli.install_crds {
        ensure_crds(&client).await?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let options = RunnerOptions {
        concurrency: cli.concurrency,
        watch_namespace: cli.watch_namespace.clone(),
    };
    let controller =
        build_volume_autoscaler_controller(client, cli.autoscaler_config(), &options, shutdown.clone())?;

    controller.await;
    shutdown.cancel();
    tracing::info!("Controller stopped");
    Ok(())
}
