//! CLI interface for kaizen

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::config::Config;
use crate::metrics::Interaction;
use crate::orchestrator::{CycleOutcome, Orchestrator};

#[derive(Parser)]
#[command(name = "kaizen")]
#[command(about = "Self-improvement loop for a conversational agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduled improvement loop until interrupted
    Run,
    /// Trigger one improvement cycle now
    Cycle,
    /// Ingest interaction records from stdin, one JSON object per line
    Ingest,
    /// Print a performance report over the trailing window
    Report {
        /// Window size in hours
        #[arg(long, default_value = "24")]
        hours: u64,
    },
    /// Show the loop's current state
    Status,
    /// Clear the halt flag after reviewing a failed rollback
    Resume,
}

/// One stdin line for `kaizen ingest`
#[derive(serde::Deserialize)]
struct IngestRecord {
    input: String,
    output: String,
    #[serde(default)]
    metrics: HashMap<String, f64>,
    #[serde(default)]
    context: HashMap<String, String>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    let orchestrator = Orchestrator::open(&config).await?;

    match cli.command {
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });
            orchestrator.run(shutdown_rx).await?;
        }
        Commands::Cycle => match orchestrator.trigger_manual_cycle().await? {
            CycleOutcome::Completed(stats) => {
                println!("{}", serde_json::to_string_pretty(&stats)?)
            }
            CycleOutcome::Skipped(reason) => println!("Skipped: {}", reason),
        },
        Commands::Ingest => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut count = 0usize;
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: IngestRecord = serde_json::from_str(line)?;
                let interaction = Interaction::from_exchange(
                    &record.input,
                    &record.output,
                    record.metrics,
                    record.context,
                );
                orchestrator.ingest(&interaction).await?;
                count += 1;
            }
            println!("Ingested {} interaction(s)", count);
        }
        Commands::Report { hours } => {
            let report = orchestrator
                .report(Duration::from_secs(hours * 3600))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let status = orchestrator.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Resume => {
            orchestrator.resume().await?;
            println!("Halt flag cleared; automatic cycles may resume");
        }
    }
    Ok(())
}
