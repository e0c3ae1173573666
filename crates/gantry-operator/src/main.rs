//! Gantry Operator - ephemeral runner pool management for Kubernetes

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use gantry_common::crd::{EphemeralRunner, EphemeralRunnerSet};
use gantry_common::telemetry::{init_telemetry, TelemetryConfig};

mod controller_runner;

/// Gantry - CRD-driven operator managing pools of single-use GitHub Actions runners
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches EphemeralRunnerSet CRDs and converges their runner
    /// populations, coordinating with the Actions dispatch service.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TLS must be ready before the kube client or any dispatch call exists
    gantry_common::install_crypto_provider();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for both resources
        let runner_set_crd = serde_yaml::to_string(&EphemeralRunnerSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize EphemeralRunnerSet CRD: {}", e))?;
        let runner_crd = serde_yaml::to_string(&EphemeralRunner::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize EphemeralRunner CRD: {}", e))?;
        println!("{runner_set_crd}---\n{runner_crd}");
        return Ok(());
    }

    // The guard flushes buffered spans and metrics when main returns
    let _telemetry = init_telemetry(TelemetryConfig {
        service_name: "gantry-operator".to_string(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

/// Ensure all Gantry CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("gantry-operator").force();

    tracing::info!("Installing EphemeralRunnerSet CRD...");
    crds.patch(
        "ephemeralrunnersets.actions.github.com",
        &params,
        &Patch::Apply(&EphemeralRunnerSet::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install EphemeralRunnerSet CRD: {}", e))?;

    tracing::info!("Installing EphemeralRunner CRD...");
    crds.patch(
        "ephemeralrunners.actions.github.com",
        &params,
        &Patch::Apply(&EphemeralRunner::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install EphemeralRunner CRD: {}", e))?;

    tracing::info!("All Gantry CRDs installed/updated");
    Ok(())
}

/// Run the operator until shutdown
async fn run_controller() -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    controller_runner::run_controllers(client).await;

    tracing::info!("Operator shut down");
    Ok(())
}
