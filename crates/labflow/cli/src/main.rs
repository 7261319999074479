//! Labflow CLI
//!
//! - `verify`: re-check the hash chain of an exported run offline
//! - `demo`: drive a three-step procedure through a QC hold and its resolution
//! - `config`: print the effective engine configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use labflow_engine::{telemetry, EngineConfig};
use std::path::PathBuf;

mod demo;

#[derive(Parser)]
#[command(name = "labflow")]
#[command(about = "Labflow - validated SOP execution and audit tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LABFLOW_CONFIG")]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an exported run (JSON lines)
    Verify {
        /// Export file written by `demo --export` or the engine API
        file: PathBuf,
    },

    /// Run the demonstration procedure against an in-memory engine
    Demo {
        /// Write the finished run and its audit trail to this file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Control reading reported by the last step
        #[arg(long, default_value_t = 107.0)]
        reading: f64,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.verbose {
        config.logging.level = "debug".into();
    }
    telemetry::init_tracing(&config.logging);

    match cli.command {
        Commands::Verify { file } => verify(&file).await,
        Commands::Demo { export, reading } => demo::run(&config, reading, export.as_deref()).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn verify(file: &std::path::Path) -> anyhow::Result<()> {
    let export = labflow_ledger::read_export(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let report = export.verify();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "run_id": export.run.id,
            "state": export.run.state,
            "events": report.total_events,
            "verified": report.verified_events,
            "head": report.head.map(|h| h.to_hex()),
            "valid": report.is_valid(),
        }))?
    );

    if !report.is_valid() {
        anyhow::bail!(
            "audit chain broken at seq {:?}: {:?}",
            report.first_invalid_seq,
            report.fault
        );
    }
    Ok(())
}
