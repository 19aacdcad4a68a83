//! sbo-orchestrator — multi-tenant Supabase instance orchestrator
//!
//! Loads configuration from the environment, wires the Lifecycle
//! Controller, Diagnostic Engine, and metrics together, and nests the
//! HTTP surface directly for local/dev use (no auth middleware of its
//! own, mirroring the node agent's `run` shape).

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::OrchestratorConfig;
use sbo_api::AppState;
use sbo_diagnostics::{DiagnosticEngine, DiagnosticsConfig};
use sbo_lifecycle::LifecycleController;
use sbo_observe::OperationsMetrics;
use sbo_runtime::{BollardDriver, RuntimeDriver};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sbo-orchestrator")]
#[command(about = "Multi-tenant Supabase instance orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load config, stand up the core, and serve the HTTP surface
    Run,

    /// Validate environment configuration without starting the server
    InitConfig,

    /// Fetch and print the running orchestrator's live metrics and exit
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sbo_orchestrator=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run().await?,
        Commands::InitConfig => init_config()?,
        Commands::Metrics => print_metrics().await?,
    }

    Ok(())
}

fn init_config() -> anyhow::Result<()> {
    match OrchestratorConfig::load() {
        Ok(config) => {
            println!("configuration OK");
            println!("  data_root:    {}", config.data_root.display());
            println!("  external_host: {}", config.external_host);
            println!("  max_instances: {}", config.max_instances);
            println!("  bind_addr:    {}", config.bind_addr);
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            std::process::exit(1);
        }
    }
}

/// Fetches the live `/metrics` endpoint from the running server rather
/// than rendering a fresh, all-zero `OperationsMetrics` in this short-lived
/// process: metrics only have meaning as the counters a running server has
/// accumulated, which a separate CLI invocation shares no state with.
async fn print_metrics() -> anyhow::Result<()> {
    let config = OrchestratorConfig::load()?;
    let url = format!("http://{}/metrics", config.bind_addr);
    let body = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach the running orchestrator at {url}"))?
        .error_for_status()
        .with_context(|| format!("orchestrator at {url} returned an error"))?
        .text()
        .await
        .with_context(|| format!("failed to read metrics response from {url}"))?;
    print!("{body}");
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = OrchestratorConfig::load()?;
    info!(
        data_root = %config.data_root.display(),
        external_host = %config.external_host,
        max_instances = config.max_instances,
        bind_addr = %config.bind_addr,
        "loaded configuration"
    );

    let driver: Arc<dyn RuntimeDriver> = Arc::new(BollardDriver::connect(&config.docker_socket)?);

    let lifecycle = Arc::new(LifecycleController::new(
        config.data_root.clone(),
        config.external_host.clone(),
        &config.template_root,
        driver,
        config.max_instances,
        config.create_timeout,
    ));

    let diagnostics = Arc::new(DiagnosticEngine::new(DiagnosticsConfig {
        cache_ttl: config.diagnostic_cache_ttl,
        rate_limit: config.diagnostic_rate_limit,
    }));

    let metrics = Arc::new(OperationsMetrics::new());
    let state = AppState::new(lifecycle, diagnostics, metrics, config.repair_backup_retention);

    if let Err(e) = sbo_api::start_api_server(state, &config.bind_addr).await {
        error!(error = %e, "HTTP surface terminated");
        return Err(e.into());
    }

    Ok(())
}
