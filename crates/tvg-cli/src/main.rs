use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tvg_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "tvg")]
#[command(about = "TV guide ratings harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest and export forever, on the interval or the cron schedule.
    Run,
    /// One ingest + export cycle.
    Sync,
    /// List the days still missing from the store.
    Pending {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Write snapshots for days that have none yet.
    Export,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tvg=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    tracing::info!(
        store = %config.database_path().display(),
        snapshots = %config.json_dumps_folder.display(),
        providers = ?config.providers,
        "configuration loaded"
    );
    let pipeline = SyncPipeline::from_config(config)
        .await
        .context("starting sync pipeline")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            Arc::new(pipeline).run_forever().await?;
        }
        Commands::Sync => {
            let summary = pipeline.run_cycle().await;
            println!(
                "sync complete: inserted={} snapshots={} cache_entries={}",
                summary.inserted(),
                summary.snapshots_written(),
                summary.cache_entries
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing cycle summary")?
            );
        }
        Commands::Pending { provider } => {
            let mut matched = false;
            for coordinator in pipeline.coordinators() {
                if provider.as_deref().is_some_and(|p| p != coordinator.provider()) {
                    continue;
                }
                matched = true;
                let dates = coordinator
                    .pending_dates()
                    .await
                    .with_context(|| format!("listing pending dates for {}", coordinator.provider()))?;
                for date in dates {
                    println!("{}\t{}", coordinator.provider(), date);
                }
            }
            if !matched {
                anyhow::bail!(
                    "provider `{}` is not configured",
                    provider.unwrap_or_default()
                );
            }
        }
        Commands::Export => {
            let summary = pipeline.exporter().export().await?;
            println!(
                "export complete: written={} existing={} empty={} failed={}",
                summary.written.len(),
                summary.existing.len(),
                summary.empty.len(),
                summary.failed.len()
            );
        }
    }

    Ok(())
}
