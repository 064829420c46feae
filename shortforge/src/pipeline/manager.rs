//! Pipeline manager: the facade that wires queue, engine and workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::engine::PipelineEngine;
use super::job_queue::JobQueue;
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::Result;
use crate::approval::{ApprovalDecision, ApprovalGateway, PendingApproval};
use crate::config::AppConfig;
use crate::database::models::{
    JobDbModel, JobFilters, JobLogDbModel, JobPriority, JobStatus, JobStatusCounts, Pagination,
};
use crate::database::repositories::{ChannelRepository, JobRepository, VideoRepository};
use crate::providers::ProviderRegistry;
use crate::resilience::BreakerStatus;
use crate::upload::Uploader;

/// Events emitted by the pipeline manager.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Job accepted into the queue.
    JobEnqueued {
        job_id: String,
        topic: String,
        channel_id: String,
    },
    /// A worker dispatched the job.
    JobStarted { job_id: String, stage: String },
    /// Job reached DONE.
    JobCompleted { job_id: String },
    /// Job reached FAILED.
    JobFailed { job_id: String },
    /// Job pushed past its channel's upload window.
    JobDeferred {
        job_id: String,
        until: DateTime<Utc>,
    },
    /// Job reached CANCELLED.
    JobCancelled { job_id: String },
    /// Job parked, waiting for a reviewer.
    ApprovalRequested { job_id: String },
    /// A reviewer decided on a parked job.
    ApprovalResolved { job_id: String, approved: bool },
}

/// Point-in-time operational snapshot, for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub counts: JobStatusCounts,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub breakers: Vec<BreakerStatus>,
}

/// The pipeline manager service.
///
/// Owns the queue, the shared engine and the worker pool, and is the only
/// surface callers need: job submission, cancellation, approval decisions
/// and stats all go through here.
pub struct PipelineManager {
    /// Job queue.
    queue: Arc<JobQueue>,
    /// Shared stage executor.
    engine: Arc<PipelineEngine>,
    /// Worker pool.
    pool: WorkerPool,
    /// Approval gateway for reviewer decisions.
    approvals: ApprovalGateway,
    /// Provider registry, kept for breaker reporting.
    registry: Arc<ProviderRegistry>,
    /// Job repository.
    job_repo: Arc<dyn JobRepository>,
    /// Channel repository, for validating job submissions.
    channel_repo: Arc<dyn ChannelRepository>,
    /// Event broadcaster.
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl PipelineManager {
    /// Create a new pipeline manager.
    pub fn new(
        config: AppConfig,
        registry: Arc<ProviderRegistry>,
        uploader: Arc<dyn Uploader>,
        job_repo: Arc<dyn JobRepository>,
        channel_repo: Arc<dyn ChannelRepository>,
        video_repo: Arc<dyn VideoRepository>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let queue = Arc::new(JobQueue::new(
            config.pipeline.queue_capacity,
            job_repo.clone(),
        ));
        let pool = WorkerPool::new(WorkerPoolConfig::from(&config));
        let engine = Arc::new(PipelineEngine::new(
            config,
            registry.clone(),
            uploader,
            job_repo.clone(),
            channel_repo.clone(),
            video_repo,
        ));

        Self {
            queue,
            engine,
            pool,
            approvals: ApprovalGateway::new(job_repo.clone()),
            registry,
            job_repo,
            channel_repo,
            event_tx,
        }
    }

    /// Re-admit jobs that survive a restart: pending and deferred rows go
    /// back into the queue, and rows stranded in RUNNING by a crash are
    /// reset first. Parked approvals stay parked.
    pub async fn recover_jobs(&self) -> Result<usize> {
        info!("Recovering jobs from database...");
        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            info!("Recovered {} jobs from database", recovered);
        } else {
            debug!("No jobs to recover from database");
        }
        Ok(recovered)
    }

    /// Start the worker pool.
    pub fn start(&self) {
        info!("Starting pipeline manager");
        self.pool.start(
            self.queue.clone(),
            self.engine.clone(),
            self.job_repo.clone(),
            self.event_tx.clone(),
        );
        info!("Pipeline manager started");
    }

    /// Stop the worker pool and wait for in-flight jobs to wind down.
    pub async fn stop(&self) {
        info!("Stopping pipeline manager");
        self.pool.stop().await;
        info!("Pipeline manager stopped");
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Submit a new production job for a topic on a channel.
    ///
    /// Fails with a validation error if the channel does not exist and with
    /// a capacity error if the queue is full.
    pub async fn create_job(
        &self,
        topic: &str,
        channel_id: &str,
        priority: JobPriority,
    ) -> Result<String> {
        self.channel_repo.get_channel(channel_id).await?;

        let mut job = JobDbModel::new(topic, channel_id);
        job.priority = priority.as_str().to_string();

        let topic = job.topic.clone();
        let channel = job.channel_id.clone();
        let job_id = self.queue.enqueue(job).await?;

        let _ = self.event_tx.send(PipelineEvent::JobEnqueued {
            job_id: job_id.clone(),
            topic,
            channel_id: channel,
        });
        Ok(job_id)
    }

    /// Cancel a job in any non-terminal state.
    ///
    /// Waiting and parked jobs are finalized immediately; running jobs are
    /// signalled and finalize cooperatively at their next await point.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobStatus> {
        let observed = self.queue.cancel(job_id).await?;
        if observed != JobStatus::Running {
            let _ = self.event_tx.send(PipelineEvent::JobCancelled {
                job_id: job_id.to_string(),
            });
        }
        Ok(observed)
    }

    /// Jobs parked at the approval stage, oldest first.
    pub async fn pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        self.approvals.pending().await
    }

    /// Approve a parked job and queue it for upload.
    pub async fn approve_job(&self, job_id: &str) -> Result<()> {
        let job = self
            .approvals
            .resolve(job_id, ApprovalDecision::Approve, None)
            .await?;
        self.queue.requeue(job);
        let _ = self.event_tx.send(PipelineEvent::ApprovalResolved {
            job_id: job_id.to_string(),
            approved: true,
        });
        Ok(())
    }

    /// Reject a parked job with an optional reason.
    pub async fn reject_job(&self, job_id: &str, reason: Option<&str>) -> Result<()> {
        self.approvals
            .resolve(job_id, ApprovalDecision::Reject, reason)
            .await?;
        let _ = self.event_tx.send(PipelineEvent::ApprovalResolved {
            job_id: job_id.to_string(),
            approved: false,
        });
        Ok(())
    }

    /// Fetch one job row.
    pub async fn get_job(&self, job_id: &str) -> Result<JobDbModel> {
        self.job_repo.get_job(job_id).await
    }

    /// List jobs matching the filters, newest first.
    pub async fn list_jobs(
        &self,
        filters: &JobFilters,
        page: &Pagination,
    ) -> Result<Vec<JobDbModel>> {
        self.job_repo.list_jobs(filters, page).await
    }

    /// Count jobs matching the filters.
    pub async fn count_jobs(&self, filters: &JobFilters) -> Result<u64> {
        self.job_repo.count_jobs(filters).await
    }

    /// Execution log of one job, oldest first.
    pub async fn get_job_logs(&self, job_id: &str) -> Result<Vec<JobLogDbModel>> {
        self.job_repo.get_logs(job_id).await
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Operational snapshot: status counts, queue depth, worker activity
    /// and the state of every provider breaker touched so far.
    pub async fn stats(&self) -> Result<PipelineStats> {
        let counts = self.job_repo.job_counts().await?;
        Ok(PipelineStats {
            counts,
            queue_depth: self.queue.depth(),
            active_workers: self.pool.active_count(),
            breakers: self.registry.breakers().snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::database::models::{ChannelDbModel, JobStage};
    use crate::database::repositories::{
        SqlxChannelRepository, SqlxJobRepository, SqlxVideoRepository,
    };
    use crate::providers::simple::{
        SimpleAssetProvider, SimpleScriptProvider, SimpleTrendProvider, SimpleVideoProvider,
        SimpleVoiceoverProvider,
    };
    use crate::resilience::CircuitBreakerManager;
    use crate::upload::LocalArchiveUploader;

    struct ManagerHarness {
        manager: PipelineManager,
        job_repo: Arc<SqlxJobRepository>,
        _data_dir: tempfile::TempDir,
    }

    async fn manager_harness(configure: impl FnOnce(&mut AppConfig)) -> ManagerHarness {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig {
            data_dir: data_dir.path().to_string_lossy().into_owned(),
            ..AppConfig::default()
        };
        configure(&mut config);

        let pool = sqlx::SqlitePool::connect(":memory:").await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        let job_repo = Arc::new(SqlxJobRepository::new(pool.clone()));
        let channel_repo = Arc::new(SqlxChannelRepository::new(pool.clone()));
        let video_repo = Arc::new(SqlxVideoRepository::new(pool));

        channel_repo
            .create_channel(&ChannelDbModel::new("tech", "TechBytes", "technology"))
            .await
            .unwrap();

        let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
        let mut registry = ProviderRegistry::new(breakers);
        registry.register_trend(Arc::new(SimpleTrendProvider::new()));
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
        let manager = PipelineManager::new(
            config,
            Arc::new(registry),
            uploader,
            job_repo.clone(),
            channel_repo,
            video_repo,
        );
        ManagerHarness {
            manager,
            job_repo,
            _data_dir: data_dir,
        }
    }

    #[tokio::test]
    async fn test_create_job_persists_row_and_emits_event() {
        let h = manager_harness(|_| {}).await;
        let mut events = h.manager.subscribe();

        let job_id = h
            .manager
            .create_job("rust iterators", "tech", JobPriority::High)
            .await
            .unwrap();

        let row = h.job_repo.get_job(&job_id).await.unwrap();
        assert_eq!(row.get_status(), Some(JobStatus::Pending));
        assert_eq!(row.get_stage(), Some(JobStage::TrendCheck));
        assert_eq!(row.get_priority(), Some(JobPriority::High));
        assert_eq!(h.manager.queue_depth(), 1);

        match events.try_recv().unwrap() {
            PipelineEvent::JobEnqueued {
                job_id: id, topic, ..
            } => {
                assert_eq!(id, job_id);
                assert_eq!(topic, "rust iterators");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_job_rejects_unknown_channel() {
        let h = manager_harness(|_| {}).await;
        let err = h
            .manager
            .create_job("rust iterators", "nope", JobPriority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_waiting_job_finalizes_row() {
        let h = manager_harness(|_| {}).await;
        let job_id = h
            .manager
            .create_job("rust enums", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let observed = h.manager.cancel_job(&job_id).await.unwrap();
        assert_eq!(observed, JobStatus::Cancelled);
        assert_eq!(h.manager.queue_depth(), 0);

        let row = h.job_repo.get_job(&job_id).await.unwrap();
        assert_eq!(row.get_status(), Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_approve_requires_parked_job() {
        let h = manager_harness(|_| {}).await;
        let job_id = h
            .manager
            .create_job("rust traits", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let err = h.manager.approve_job(&job_id).await.unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_stats_reports_counts_and_depth() {
        let h = manager_harness(|_| {}).await;
        h.manager
            .create_job("rust lifetimes", "tech", JobPriority::Normal)
            .await
            .unwrap();
        h.manager
            .create_job("rust macros", "tech", JobPriority::Low)
            .await
            .unwrap();

        let stats = h.manager.stats().await.unwrap();
        assert_eq!(stats.counts.pending, 2);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.active_workers, 0);
        assert!(stats.breakers.is_empty());
    }
}
