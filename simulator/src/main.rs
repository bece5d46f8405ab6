//! CoreBank Simulator
//!
//! Drives the ledger engine with named scenarios or a random concurrent
//! workload and checks that money is conserved.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use corebank_ledger::{LedgerConfig, LedgerEngine, MemoryLedgerStore, PgLedgerStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// CoreBank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "CoreBank ledger scenario runner and load generator")]
struct Args {
    /// Number of simulated accounts to open
    #[arg(short, long, default_value = "3")]
    accounts: usize,

    /// Built-in scenario to run
    #[arg(short, long)]
    scenario: Option<String>,

    /// Scenario to run, as a JSON file
    #[arg(long, conflicts_with = "scenario")]
    scenario_file: Option<PathBuf>,

    /// Random workload size when no scenario is given
    #[arg(short, long, default_value = "200")]
    operations: usize,

    /// Concurrent workload tasks
    #[arg(short, long, default_value = "4")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL URL; the in-memory store is used when absent
    #[arg(long)]
    database_url: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(url) = &args.database_url {
        config.storage.database_url = url.clone();
    }

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    config.validate().map_err(anyhow::Error::msg)?;

    info!("Starting CoreBank Simulator");

    let (engine, faults) = match &args.database_url {
        Some(_) => {
            let store = PgLedgerStore::connect(&config.storage).await?;
            store.migrate().await?;
            info!("Using PostgreSQL store");
            (LedgerEngine::from_config(Arc::new(store), &config), None)
        }
        None => {
            let store = MemoryLedgerStore::new();
            info!("Using in-memory store");
            (
                LedgerEngine::from_config(Arc::new(store.clone()), &config),
                Some(store),
            )
        }
    };

    let mut controller = SimulationController::new(engine, faults, args.seed);
    controller.initialize(args.accounts).await?;

    let scenario = match (&args.scenario, &args.scenario_file) {
        (Some(name), _) => Some(Scenario::load(name)?),
        (None, Some(path)) => Some(Scenario::from_file(path)?),
        (None, None) => None,
    };

    match scenario {
        Some(scenario) => controller.run_scenario(&scenario).await?,
        None => controller.run(args.operations, args.concurrency).await?,
    }

    controller.verify().await?;

    let metrics = controller.metrics().await;
    info!("Simulation complete");
    info!("Total operations: {}", metrics.total_operations);
    info!("Successful: {}", metrics.successful_operations);
    info!("Rejected: {}", metrics.rejected_operations);
    info!("Conflicted: {}", metrics.conflicted_operations);
    info!("Failed: {}", metrics.failed_operations);
    info!("Records captured: {}", metrics.captured_records);
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!(
        "Latency avg/p50/p99: {}/{}/{}ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );

    Ok(())
}
