use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workload_sync::{build_pipeline, connect_store, maybe_build_scheduler, SyncConfig};
use workload_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "workload-cli")]
#[command(about = "Workshop workload sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync {
        /// Read the feed from a fixture bundle instead of the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API; runs the periodic pass too when the scheduler is enabled.
    Serve,
    /// Run the periodic pass only.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            let pipeline = build_pipeline(&config, fixtures.as_deref()).await?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current opportunity");
                    let _ = tx.send(true);
                }
            });
            let summary = pipeline.run_once_with_shutdown(rx).await?;
            println!(
                "sync {}: run_id={} products={} opportunities={} reconciled={} failed={} deactivated={} rejected={}",
                summary.status,
                summary.run_id,
                summary.products_processed,
                summary.opportunities_seen,
                summary.opportunities_reconciled,
                summary.opportunities_failed,
                summary.opportunities_deactivated,
                summary.records_rejected
            );
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(build_pipeline(&config, None).await?);
            let scheduler = maybe_build_scheduler(&config, pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }
            let state = AppState {
                store: pipeline.store().clone(),
                window_days: config.window_days,
                default_carpenters: config.default_carpenters,
                pipeline: Some(pipeline),
            };
            workload_web::serve(state, config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(build_pipeline(&config, None).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; waiting for interrupt");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
