// Cache scheduler binary entry point

use anyhow::Context;
use common::config::Settings;
use common::store::{DirectoryIndexCache, DirectoryStore};
use common::{telemetry, CacheCandidate, CacheScheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
    )?;
    info!("Starting cache scheduler");

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        store_path = %settings.store.path.display(),
        lock_dir = %settings.cache.lock_dir.display(),
        update_on_startup = settings.cache.update_on_startup,
        daily_update_time = %settings.cache.daily_update_time,
        "Configuration loaded"
    );

    let store = Arc::new(DirectoryStore::new(&settings.store.path));
    let candidates: Vec<Arc<dyn CacheCandidate>> =
        vec![Arc::new(DirectoryIndexCache::new(&store))];

    let scheduler = CacheScheduler::new(
        store,
        candidates,
        &settings.cache.lock_dir,
        settings.cache.scheduler_options(),
    );
    scheduler
        .start(
            settings.cache.update_on_startup,
            settings.cache.daily_update_time,
        )
        .context("Failed to start cache scheduler")?;

    match serde_json::to_string(&scheduler.status()) {
        Ok(status) => info!(status = %status, "Cache scheduler running"),
        Err(e) => error!(error = %e, "Failed to render cache status"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    let cancelled = scheduler.shutdown();
    let deadline = Instant::now() + WORKER_STOP_GRACE;
    while cancelled.iter().any(|run| !run.is_actually_stopped()) && Instant::now() < deadline {
        sleep(Duration::from_millis(100)).await;
    }
    for run in cancelled.iter().filter(|run| !run.is_actually_stopped()) {
        warn!(
            job = %run.job(),
            run_id = %run.id(),
            "Refresh worker still running at exit"
        );
    }

    info!("Cache scheduler stopped");
    Ok(())
}
