use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use replq_kernel::config::QueueConfig;
use replq_kernel::log::InMemoryCoordinator;
use replq_kernel::queue::{InsertTimes, QueueStatus};
use replq_kernel::simulate::{simulate_queue, ExecutedEntry, PostponedEntry, SimulationReport};

/// Replication queue CLI
#[derive(Parser, Debug)]
#[command(name = "replq")]
#[command(about = "Replicated table queue (dry-run)", long_about = None)]
struct Cli {
    /// Path to a coordinator snapshot JSON (`path -> data`)
    #[arg(long)]
    coordinator: String,

    /// Path to a JSON array of the part names present locally
    #[arg(long)]
    parts: String,

    /// Path to queue config JSON
    #[arg(long)]
    config: Option<String>,

    /// Hold back merges and mutations, as when the merge executor is paused
    #[arg(long)]
    suspend_merges: bool,

    /// Stop after handing out this many entries
    #[arg(long, default_value_t = 10_000)]
    max_steps: usize,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    executed: Vec<ExecutedEntry>,
    postponed: Vec<PostponedEntry>,
    status: QueueStatus,
    insert_times: InsertTimes,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("replq=info,replq_kernel=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load coordinator snapshot
    // ----------------------------
    let snapshot_data = fs::read_to_string(&cli.coordinator)
        .with_context(|| format!("reading coordinator snapshot {}", cli.coordinator))?;
    let snapshot: BTreeMap<String, String> = serde_json::from_str(&snapshot_data)?;
    let coordinator = InMemoryCoordinator::from_snapshot(snapshot);

    // ----------------------------
    // Load local parts
    // ----------------------------
    let parts_data = fs::read_to_string(&cli.parts)
        .with_context(|| format!("reading parts list {}", cli.parts))?;
    let parts: Vec<String> = serde_json::from_str(&parts_data)?;

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = cli.config {
        let data = fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
        serde_json::from_str::<QueueConfig>(&data)?
    } else {
        QueueConfig::default_config()
    };

    tracing::info!(
        replica = %config.replica_path,
        parts = parts.len(),
        suspend_merges = cli.suspend_merges,
        "starting dry run"
    );

    // ----------------------------
    // Run simulation
    // ----------------------------
    let gate = AtomicBool::new(cli.suspend_merges);
    let SimulationReport {
        executed,
        postponed,
        status,
        insert_times,
    } = simulate_queue(&coordinator, &parts, config, &gate, cli.max_steps)?;

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        executed,
        postponed,
        status,
        insert_times,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
