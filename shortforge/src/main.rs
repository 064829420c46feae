use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shortforge::config::AppConfig;
use shortforge::database;
use shortforge::database::repositories::{
    SqlxChannelRepository, SqlxJobRepository, SqlxVideoRepository,
};
use shortforge::logging;
use shortforge::pipeline::PipelineManager;
use shortforge::providers::ProviderRegistry;
use shortforge::resilience::{CircuitBreakerManager, CircuitState};
use shortforge::scheduler::UploadScheduler;
use shortforge::upload::LocalArchiveUploader;

/// How often the running pipeline writes a one-line health snapshot.
const STATS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    // Keep the guard alive or the file appender stops flushing
    let _log_guard = logging::init_logging(&config.log_dir)?;

    info!("Starting shortforge");

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let job_repo = Arc::new(SqlxJobRepository::new(pool.clone()));
    let channel_repo = Arc::new(SqlxChannelRepository::new(pool.clone()));
    let video_repo = Arc::new(SqlxVideoRepository::new(pool));

    let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
    let registry = Arc::new(ProviderRegistry::from_config(&config, breakers)?);
    let uploader = Arc::new(LocalArchiveUploader::new(&config.data_dir));

    let manager = Arc::new(PipelineManager::new(
        config.clone(),
        registry,
        uploader,
        job_repo.clone(),
        channel_repo.clone(),
        video_repo,
    ));

    // Re-admit jobs interrupted by the previous shutdown before workers start
    manager.recover_jobs().await?;
    manager.start();

    let shutdown = CancellationToken::new();
    logging::start_retention_cleanup(&config.log_dir, shutdown.clone());

    let scheduler = Arc::new(UploadScheduler::new(
        config.scheduler.clone(),
        config.upload.clone(),
        manager.clone(),
        channel_repo,
        job_repo,
    ));
    scheduler.start_background_task(shutdown.clone());

    spawn_stats_reporter(manager.clone(), shutdown.clone());

    info!("shortforge running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    manager.stop().await;

    info!("shortforge stopped");
    Ok(())
}

/// Log queue, worker and breaker health on a fixed interval so a stalled
/// pipeline is visible from the log stream alone.
fn spawn_stats_reporter(manager: Arc<PipelineManager>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match manager.stats().await {
                        Ok(stats) => {
                            let open_breakers = stats
                                .breakers
                                .iter()
                                .filter(|b| b.state == CircuitState::Open)
                                .count();
                            info!(
                                pending = stats.counts.pending,
                                running = stats.counts.running,
                                awaiting_approval = stats.counts.awaiting_approval,
                                deferred = stats.counts.deferred,
                                succeeded = stats.counts.succeeded,
                                failed = stats.counts.failed,
                                queue_depth = stats.queue_depth,
                                active_workers = stats.active_workers,
                                open_breakers,
                                "pipeline status"
                            );
                        }
                        Err(e) => warn!("failed to collect pipeline stats: {e}"),
                    }
                }
            }
        }
    });
}
