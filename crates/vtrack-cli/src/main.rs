use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vtrack_sync::{RunScope, RunSummary};

#[derive(Debug, Parser)]
#[command(name = "vtrack-cli")]
#[command(about = "Visa wait-time, bulletin and processing-queue pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and publish every artifact once.
    Run,
    /// Gazetteer + wait-time table only.
    VisaWait,
    /// Visa bulletin + processing times only.
    Immigration,
    /// Re-run everything on the cron expression in pipeline.yaml until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vtrack_sync=info,vtrack_adapters=info,vtrack_storage=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: run_id={} scope={:?} wait_rows={} unresolved={} bulletin_rows={} queue_rows={} warnings={} output={}",
        summary.run_id,
        summary.scope,
        summary.visa_wait_rows,
        summary.unresolved_cities,
        summary.bulletin_rows,
        summary.queue_rows,
        summary.warnings,
        summary.output_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let root = Path::new(".");

    let scope = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => RunScope::All,
        Commands::VisaWait => RunScope::VisaWait,
        Commands::Immigration => RunScope::Immigration,
        Commands::Schedule => {
            return vtrack_sync::run_scheduled_from_workspace(root, RunScope::All).await;
        }
    };

    info!(?scope, "starting run");
    let summary = vtrack_sync::run_once_from_workspace(root, scope).await?;
    print_summary(&summary);
    Ok(())
}
