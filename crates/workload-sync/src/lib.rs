//! Reconciliation pass orchestration, configuration and scheduling.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use workload_core::RunSummary;
use workload_feed::{CurrentRmsFeed, FixtureFeed, HttpFetcher, SourceFeed};
use workload_storage::{PgStore, Store};

mod config;
mod pipeline;

pub use config::{
    load_feed_filters, PipelineSettings, SyncConfig, DEFAULT_FETCH_EXCLUDED_PRODUCT_ID,
    MAX_WINDOW_DAYS,
};
pub use pipeline::{SyncPipeline, PIPELINE_LOCK};

pub const CRATE_NAME: &str = "workload-sync";

/// Register the periodic pass when the scheduler is enabled. The caller starts the scheduler.
pub async fn maybe_build_scheduler<S: Store>(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline<S>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, status = %summary.status, "scheduled sync finished"),
                Err(err) => error!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

pub fn live_feed(config: &SyncConfig) -> Result<Arc<dyn SourceFeed>> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    Ok(Arc::new(CurrentRmsFeed::new(http, config.current_rms_config())))
}

pub fn fixture_feed(path: &Path) -> Result<Arc<dyn SourceFeed>> {
    Ok(Arc::new(FixtureFeed::load(path)?))
}

/// Pipeline over the database and the live feed, or over a fixture bundle when one is given.
pub async fn build_pipeline(
    config: &SyncConfig,
    fixtures: Option<&Path>,
) -> Result<SyncPipeline<PgStore>> {
    let store = Arc::new(connect_store(config).await?);
    let feed = match fixtures {
        Some(path) => fixture_feed(path)?,
        None => live_feed(config)?,
    };
    Ok(SyncPipeline::new(store, feed, config.pipeline_settings()?))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline(&config, None).await?;
    pipeline.run_once().await
}
