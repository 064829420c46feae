//! Worker pool that drains the job queue into the pipeline engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::database::models::{JobErrorEntry, JobLogEntry, JobStage, JobStatus};
use crate::database::repositories::JobRepository;
use crate::error::Error;

use super::engine::{PipelineEngine, RunOutcome};
use super::job_queue::JobQueue;
use super::manager::PipelineEvent;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks, which is also the concurrency ceiling.
    pub workers: usize,
    /// Wall-clock budget for one dispatched run of a job. Runs that exceed
    /// it are cancelled mid-stage and the job is failed with a timeout.
    /// Approval waits happen while the job is parked, outside any dispatch,
    /// so they never consume this budget.
    pub job_timeout: Duration,
    /// How often idle workers re-scan the queue. Deferred jobs become
    /// visible again through this poll, so it also bounds how late a
    /// deferred job wakes up.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            job_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl From<&AppConfig> for WorkerPoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.pipeline.max_concurrent_jobs,
            job_timeout: config.job_timeout(),
            ..Self::default()
        }
    }
}

/// A pool of worker tasks that claim jobs and drive them through the
/// pipeline engine.
///
/// Each worker holds a semaphore permit for the duration of one dispatched
/// run, so at most `workers` jobs execute simultaneously. Jobs parked for
/// approval or deferred past an upload window release their permit
/// immediately.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    active_jobs: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.workers)),
            config,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker tasks.
    pub fn start(
        &self,
        queue: Arc<JobQueue>,
        engine: Arc<PipelineEngine>,
        repo: Arc<dyn JobRepository>,
        events: broadcast::Sender<PipelineEvent>,
    ) {
        let poll_interval = self.config.poll_interval;
        let job_timeout = self.config.job_timeout;

        info!("Starting worker pool with {} workers", self.config.workers);

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..self.config.workers {
                let semaphore = self.semaphore.clone();
                let shutdown = self.shutdown.clone();
                let active_jobs = self.active_jobs.clone();
                let queue = queue.clone();
                let engine = engine.clone();
                let repo = repo.clone();
                let events = events.clone();
                let notifier = queue.notifier();

                join_set.spawn(async move {
                    debug!("worker {i} started");

                    loop {
                        if shutdown.is_cancelled() {
                            debug!("worker {i} shutting down");
                            break;
                        }

                        // Wake on enqueue, or poll for deferred jobs whose
                        // window has opened.
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }

                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };

                        let job = match queue.claim().await {
                            Ok(Some(job)) => job,
                            Ok(None) => {
                                drop(permit);
                                continue;
                            }
                            Err(e) => {
                                error!("failed to claim next job: {e}");
                                drop(permit);
                                continue;
                            }
                        };

                        let job_id = job.id.clone();
                        let stage = job.stage.clone();
                        let token = queue.get_cancellation_token(&job_id).unwrap_or_default();

                        active_jobs.fetch_add(1, Ordering::SeqCst);
                        debug!("worker {i} dispatching job {job_id} at {stage}");
                        let _ = events.send(PipelineEvent::JobStarted {
                            job_id: job_id.clone(),
                            stage,
                        });

                        match tokio::time::timeout(job_timeout, engine.run(job, token)).await {
                            Ok(Ok(RunOutcome::Succeeded)) => {
                                let _ = events.send(PipelineEvent::JobCompleted {
                                    job_id: job_id.clone(),
                                });
                            }
                            Ok(Ok(RunOutcome::Parked)) => {
                                let _ = events.send(PipelineEvent::ApprovalRequested {
                                    job_id: job_id.clone(),
                                });
                            }
                            Ok(Ok(RunOutcome::Deferred { until })) => {
                                // The engine already persisted the deferral;
                                // put the row back so a worker picks it up
                                // once the window opens.
                                match repo.get_job(&job_id).await {
                                    Ok(row) => queue.requeue(row),
                                    Err(e) => {
                                        error!("failed to requeue deferred job {job_id}: {e}")
                                    }
                                }
                                let _ = events.send(PipelineEvent::JobDeferred {
                                    job_id: job_id.clone(),
                                    until,
                                });
                            }
                            Ok(Ok(RunOutcome::Failed)) => {
                                let _ = events.send(PipelineEvent::JobFailed {
                                    job_id: job_id.clone(),
                                });
                            }
                            Ok(Ok(RunOutcome::Cancelled)) => {
                                let _ = events.send(PipelineEvent::JobCancelled {
                                    job_id: job_id.clone(),
                                });
                            }
                            Ok(Err(e)) => {
                                // Persistence failed mid-run; leave the row
                                // for startup recovery to reset.
                                error!("job {job_id} aborted on an internal error: {e}");
                            }
                            Err(_) => {
                                warn!(
                                    "job {job_id} exceeded its {}s dispatch deadline",
                                    job_timeout.as_secs()
                                );
                                fail_timed_out(&repo, &job_id, job_timeout).await;
                                let _ = events.send(PipelineEvent::JobFailed {
                                    job_id: job_id.clone(),
                                });
                            }
                        }

                        active_jobs.fetch_sub(1, Ordering::SeqCst);
                        queue.complete(&job_id);
                        drop(permit);
                    }
                });
            }
        }
    }

    /// Stop the worker pool and wait for in-flight workers to exit.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.shutdown.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Number of jobs currently being executed.
    pub fn active_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }
}

/// Persist the failure for a job whose dispatch deadline elapsed. The
/// engine future was dropped mid-stage, so the row still reads RUNNING.
async fn fail_timed_out(repo: &Arc<dyn JobRepository>, job_id: &str, budget: Duration) {
    let mut job = match repo.get_job(job_id).await {
        Ok(job) => job,
        Err(e) => {
            error!("failed to load timed-out job {job_id}: {e}");
            return;
        }
    };

    let stage = job.get_stage().unwrap_or(JobStage::TrendCheck);
    let err = Error::timeout(format!("job dispatch at {stage}"), budget.as_secs());
    if let Err(e) = job.push_error(JobErrorEntry::new(stage, err.kind(), err.to_string())) {
        warn!("failed to record timeout for job {job_id}: {e}");
    }

    let now = Utc::now().to_rfc3339();
    job.status = JobStatus::Failed.as_str().to_string();
    job.completed_at = Some(now.clone());
    job.updated_at = now;
    if let Err(e) = repo.update_job(&job).await {
        error!("failed to mark job {job_id} failed after timeout: {e}");
        return;
    }
    let _ = repo
        .add_log(
            job_id,
            &JobLogEntry::error(format!("job failed at {stage}: {err}")),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use crate::database::models::{ChannelDbModel, JobDbModel};
    use crate::database::repositories::{
        ChannelRepository, SqlxChannelRepository, SqlxJobRepository, SqlxVideoRepository,
    };
    use crate::providers::simple::{
        SimpleAssetProvider, SimpleScriptProvider, SimpleVideoProvider, SimpleVoiceoverProvider,
    };
    use crate::providers::{Provider, ProviderRegistry, TrendProvider, TrendReport, TrendRequest};
    use crate::resilience::CircuitBreakerManager;
    use crate::upload::LocalArchiveUploader;
    use async_trait::async_trait;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_worker_pool_config_from_app_config() {
        let mut app = AppConfig::default();
        app.pipeline.max_concurrent_jobs = 5;
        app.pipeline.job_timeout_minutes = 10;

        let config = WorkerPoolConfig::from(&app);
        assert_eq!(config.workers, 5);
        assert_eq!(config.job_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_worker_pool_creation() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        assert_eq!(pool.active_count(), 0);
        assert!(pool.is_running());
    }

    /// Trend backend that parks inside the stage until the gate opens,
    /// recording how many calls are in flight at once.
    struct GatedTrendProvider {
        gate: Arc<Semaphore>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Provider for GatedTrendProvider {
        fn name(&self) -> &str {
            "gated"
        }
    }

    #[async_trait]
    impl TrendProvider for GatedTrendProvider {
        async fn check_trend(&self, request: &TrendRequest) -> crate::Result<TrendReport> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            drop(permit);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(TrendReport {
                topic: request.topic.clone(),
                trending: true,
                momentum: 0.8,
                related_topics: Vec::new(),
                checked_at: Utc::now(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_caps_concurrent_jobs() {
        let data_dir = tempfile::tempdir().unwrap();
        let db_path = data_dir.path().join("pool.db");
        let db_url = format!(
            "sqlite:{}?mode=rwc",
            db_path.to_string_lossy().replace('\\', "/")
        );
        let db = crate::database::init_pool(&db_url).await.unwrap();
        crate::database::run_migrations(&db).await.unwrap();

        let job_repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(db.clone()));
        let channel_repo = Arc::new(SqlxChannelRepository::new(db.clone()));
        let video_repo = Arc::new(SqlxVideoRepository::new(db));
        channel_repo
            .create_channel(&ChannelDbModel::new("tech", "TechBytes", "technology"))
            .await
            .unwrap();

        let config = AppConfig {
            data_dir: data_dir.path().to_string_lossy().into_owned(),
            quality: QualityConfig {
                min_quality_score: 30.0,
                improve_floor: 10.0,
                ..QualityConfig::default()
            },
            ..AppConfig::default()
        };

        let gate = Arc::new(Semaphore::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
        let mut registry = ProviderRegistry::new(breakers);
        registry.register_trend(Arc::new(GatedTrendProvider {
            gate: gate.clone(),
            in_flight: in_flight.clone(),
            peak: peak.clone(),
        }));
        registry.register_script(Arc::new(SimpleScriptProvider::new(
            config.quality.words_per_second,
        )));
        registry.register_asset(Arc::new(SimpleAssetProvider::new(&config.data_dir)));
        registry.register_voiceover(Arc::new(SimpleVoiceoverProvider::new(
            &config.data_dir,
            config.quality.words_per_second,
        )));
        registry.register_video(Arc::new(SimpleVideoProvider::new(&config.data_dir)));

        let uploader = Arc::new(LocalArchiveUploader::new(&config.data_dir));
        let engine = Arc::new(PipelineEngine::new(
            config,
            Arc::new(registry),
            uploader,
            job_repo.clone(),
            channel_repo,
            video_repo,
        ));

        let queue = Arc::new(JobQueue::new(8, job_repo.clone()));
        for i in 0..4 {
            queue
                .enqueue(JobDbModel::new(format!("topic {i}"), "tech"))
                .await
                .unwrap();
        }

        let pool = WorkerPool::new(WorkerPoolConfig {
            workers: 2,
            ..WorkerPoolConfig::default()
        });
        let (events, _events_rx) = broadcast::channel(64);
        pool.start(queue.clone(), engine, job_repo.clone(), events);

        // Two runs park inside the trend stage; the other two jobs must
        // stay queued until a worker frees up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while in_flight.load(Ordering::SeqCst) < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "workers never picked up the backlog"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_count(), 2);

        gate.add_permits(4);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let counts = job_repo.job_counts().await.unwrap();
            if counts.awaiting_approval == 4 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "backlog never drained to the approval gate"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        pool.stop().await;
    }
}
