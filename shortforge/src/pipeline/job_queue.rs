//! Database-backed job queue implementation.
//!
//! Every admitted job is persisted before it becomes visible to workers, so
//! a restart never loses queued work. Dispatch order is by effective
//! priority: the base tier plus an aging boost that grows while a job
//! waits, capped at the top tier. Within a tier the oldest job wins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::{JobDbModel, JobLogEntry, JobPriority, JobStatus};
use crate::database::repositories::JobRepository;
use crate::{Error, Result};

/// Seconds of waiting that promote a job by one priority tier.
const AGING_STEP_SECS: i64 = 300;

/// The job queue.
///
/// Holds dispatchable jobs in memory for selection; the database row is the
/// source of truth for state. Claiming a job marks it `RUNNING` and hands
/// out a cancellation token that the engine polls between stages.
pub struct JobQueue {
    /// Admission limit for new jobs. Re-admissions bypass it.
    capacity: usize,
    repo: Arc<dyn JobRepository>,
    /// Jobs visible to dispatch, keyed by id. Claiming removes the entry.
    waiting: DashMap<String, JobDbModel>,
    /// Number of entries in `waiting`.
    depth: AtomicUsize,
    /// Wakes workers when a job is admitted.
    notify: Arc<Notify>,
    /// Tokens for jobs currently being executed.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl JobQueue {
    pub fn new(capacity: usize, repo: Arc<dyn JobRepository>) -> Self {
        Self {
            capacity,
            repo,
            waiting: DashMap::new(),
            depth: AtomicUsize::new(0),
            notify: Arc::new(Notify::new()),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Notifier that fires when a job is admitted. Workers select on it.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Number of jobs waiting for dispatch (including deferred ones).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Admit a new job. Persists it, then makes it visible to workers.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the queue is full; the
    /// caller decides whether to drop or retry later.
    pub async fn enqueue(&self, job: JobDbModel) -> Result<String> {
        if job.get_status() != Some(JobStatus::Pending) {
            return Err(Error::validation(format!(
                "only PENDING jobs can be enqueued (job {} is {})",
                job.id, job.status
            )));
        }

        self.reserve_slot()?;
        if let Err(e) = self.repo.create_job(&job).await {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        let job_id = job.id.clone();
        info!(
            job_id = %job_id,
            topic = %job.topic,
            channel_id = %job.channel_id,
            priority = %job.priority,
            "job enqueued"
        );
        self.waiting.insert(job_id.clone(), job);
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Re-admit an already persisted job: a deferred upload whose window
    /// reopened, or an approved job heading back to a worker. Capacity does
    /// not apply; persisted work is never dropped.
    pub fn requeue(&self, job: JobDbModel) {
        let job_id = job.id.clone();
        if self.waiting.insert(job_id.clone(), job).is_none() {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
        debug!(job_id = %job_id, "job requeued");
        self.notify.notify_one();
    }

    /// Wait until a job is admitted. May wake spuriously; callers loop.
    pub async fn wait_for_job(&self) {
        self.notify.notified().await;
    }

    /// Claim the next runnable job, marking it `RUNNING`.
    ///
    /// Deferred jobs stay invisible until their `not_before` passes.
    /// Returns `None` when nothing is currently runnable.
    pub async fn claim(&self) -> Result<Option<JobDbModel>> {
        loop {
            let now = Utc::now();
            let Some(job_id) = self.next_eligible(now) else {
                return Ok(None);
            };
            // Another worker may have raced us to this entry.
            let Some((_, mut job)) = self.waiting.remove(&job_id) else {
                continue;
            };
            self.depth.fetch_sub(1, Ordering::SeqCst);

            job.status = JobStatus::Running.as_str().to_string();
            // Preserved across re-admissions so elapsed-time reporting
            // spans the whole run, not just the latest dispatch.
            if job.started_at.is_none() {
                job.started_at = Some(now.to_rfc3339());
            }
            job.not_before = None;
            job.updated_at = now.to_rfc3339();
            if let Err(e) = self.repo.update_job(&job).await {
                // Transient persistence failure (e.g. SQLITE_BUSY): put the
                // entry back so the job is not lost until restart recovery.
                job.status = JobStatus::Pending.as_str().to_string();
                if self.waiting.insert(job_id, job).is_none() {
                    self.depth.fetch_add(1, Ordering::SeqCst);
                }
                self.notify.notify_one();
                return Err(e);
            }

            self.cancellation_tokens
                .insert(job_id.clone(), CancellationToken::new());
            debug!(job_id = %job_id, stage = %job.stage, "job claimed");
            return Ok(Some(job));
        }
    }

    /// Token for a currently executing job, if any.
    pub fn get_cancellation_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.cancellation_tokens
            .get(job_id)
            .map(|entry| entry.value().clone())
    }

    /// Release queue-side tracking for a job whose run ended. The engine has
    /// already persisted the job's final state.
    pub fn complete(&self, job_id: &str) {
        self.cancellation_tokens.remove(job_id);
        debug!(job_id, "job released");
    }

    /// Cancel a job.
    ///
    /// Waiting jobs are marked `CANCELLED` directly. Running jobs get their
    /// token cancelled and finish cooperatively; the returned status tells
    /// the caller which path was taken. Terminal jobs cannot be cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        let token = self
            .cancellation_tokens
            .get(job_id)
            .map(|entry| entry.value().clone());
        if let Some(token) = token {
            token.cancel();
            info!(job_id, "cancellation signalled to running job");
            return Ok(JobStatus::Running);
        }

        if self.waiting.remove(job_id).is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }

        let mut job = self.repo.get_job(job_id).await?;
        match job.get_status() {
            Some(status) if status.is_terminal() => Err(Error::InvalidStateTransition {
                from: status.as_str().to_string(),
                to: JobStatus::Cancelled.as_str().to_string(),
            }),
            _ => {
                let now = Utc::now().to_rfc3339();
                job.status = JobStatus::Cancelled.as_str().to_string();
                job.completed_at = Some(now.clone());
                job.updated_at = now;
                self.repo.update_job(&job).await?;
                self.repo
                    .add_log(job_id, &JobLogEntry::warn("cancelled before dispatch"))
                    .await?;
                info!(job_id, "queued job cancelled");
                Ok(JobStatus::Cancelled)
            }
        }
    }

    /// Rebuild the dispatch set from the database after a restart.
    ///
    /// Jobs stranded in `RUNNING` are reset to `PENDING` first. Jobs parked
    /// for human approval stay out of dispatch until a reviewer decides.
    /// Returns how many jobs became dispatchable.
    pub async fn recover(&self) -> Result<usize> {
        let reset = self.repo.reset_running_jobs().await?;
        if reset > 0 {
            warn!("reset {reset} jobs stranded in RUNNING back to PENDING");
        }

        self.waiting.clear();
        self.cancellation_tokens.clear();

        let mut restored = 0usize;
        for job in self.repo.list_active_jobs().await? {
            if job.get_status() == Some(JobStatus::AwaitingApproval) {
                continue;
            }
            self.waiting.insert(job.id.clone(), job);
            restored += 1;
        }
        self.depth.store(restored, Ordering::SeqCst);
        if restored > 0 {
            info!("restored {restored} queued jobs from the database");
            self.notify.notify_one();
        }
        Ok(restored)
    }

    /// Pick the id of the best runnable job: highest effective rank, then
    /// oldest `created_at`.
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<String> {
        let mut best: Option<(i32, DateTime<Utc>, String)> = None;
        for entry in self.waiting.iter() {
            let job = entry.value();
            if !is_eligible(job, now) {
                continue;
            }
            let rank = effective_rank(job, now);
            let created = parse_ts(&job.created_at).unwrap_or(now);
            let better = match &best {
                None => true,
                Some((best_rank, best_created, _)) => {
                    rank > *best_rank || (rank == *best_rank && created < *best_created)
                }
            };
            if better {
                best = Some((rank, created, entry.key().clone()));
            }
        }
        best.map(|(_, _, id)| id)
    }

    fn reserve_slot(&self) -> Result<()> {
        let mut current = self.depth.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return Err(Error::capacity(format!(
                    "job queue is full ({} jobs)",
                    self.capacity
                )));
            }
            match self.depth.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

fn is_eligible(job: &JobDbModel, now: DateTime<Utc>) -> bool {
    match job.get_status() {
        Some(JobStatus::Pending) => true,
        Some(JobStatus::Deferred) => job
            .not_before
            .as_deref()
            .and_then(parse_ts)
            .map(|t| t <= now)
            .unwrap_or(true),
        _ => false,
    }
}

/// Base tier plus one tier per [`AGING_STEP_SECS`] of waiting, capped at
/// the top tier so aged jobs compete with, rather than overtake, genuinely
/// critical work.
fn effective_rank(job: &JobDbModel, now: DateTime<Utc>) -> i32 {
    let base = job.get_priority().unwrap_or_default().rank();
    let waited = parse_ts(&job.created_at)
        .map(|created| (now - created).num_seconds().max(0))
        .unwrap_or(0);
    let boost = (waited / AGING_STEP_SECS) as i32;
    (base + boost).min(JobPriority::Critical.rank())
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
