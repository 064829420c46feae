//! Human approval gateway.
//!
//! Jobs reaching `HUMAN_APPROVAL` park in the store as `AWAITING_APPROVAL`
//! and hold no worker slot. The decision arrives through
//! [`ApprovalGateway::resolve`], possibly after a process restart;
//! everything needed to resume lives in the job row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::Result;
use crate::database::models::{JobDbModel, JobErrorEntry, JobLogEntry, JobStage, JobStatus};
use crate::database::repositories::JobRepository;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Summary of one job parked for review.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub job_id: String,
    pub channel_id: String,
    pub topic: String,
    pub title: Option<String>,
    pub video_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub quality_score: Option<f64>,
    pub waiting_since: String,
}

impl PendingApproval {
    fn from_job(job: &JobDbModel) -> Self {
        let artifacts = job.get_artifacts();
        Self {
            job_id: job.id.clone(),
            channel_id: job.channel_id.clone(),
            topic: job.topic.clone(),
            title: artifacts.title().map(str::to_owned),
            video_path: artifacts.video.as_ref().map(|v| v.value.video_path.clone()),
            thumbnail_path: artifacts.thumbnail.as_ref().map(|t| t.value.path.clone()),
            quality_score: job.quality_score,
            waiting_since: job.stage_entered_at.clone(),
        }
    }
}

pub struct ApprovalGateway {
    repo: Arc<dyn JobRepository>,
}

impl ApprovalGateway {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self { repo }
    }

    /// Park a job pending review. The caller must stop executing the job
    /// once this returns; parking is what frees its worker slot.
    pub async fn request(&self, job: &mut JobDbModel) -> Result<()> {
        job.status = JobStatus::AwaitingApproval.as_str().to_string();
        job.updated_at = Utc::now().to_rfc3339();
        self.repo.update_job(job).await?;
        self.repo
            .add_log(
                &job.id,
                &JobLogEntry::info("video ready for review; awaiting human approval"),
            )
            .await?;
        info!(job_id = %job.id, "approval requested");
        Ok(())
    }

    /// Jobs currently awaiting a decision.
    pub async fn pending(&self) -> Result<Vec<PendingApproval>> {
        let jobs = self
            .repo
            .list_jobs_by_status(JobStatus::AwaitingApproval)
            .await?;
        Ok(jobs.iter().map(PendingApproval::from_job).collect())
    }

    /// Apply a human decision to a parked job.
    ///
    /// Approval advances the job to `UPLOAD` and returns it as `PENDING` so
    /// the caller can re-enqueue it. `started_at` is shifted forward by the
    /// parked duration so elapsed-processing numbers cover pipeline work,
    /// not the review wait. Rejection is terminal.
    pub async fn resolve(
        &self,
        job_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<JobDbModel> {
        let mut job = self.repo.get_job(job_id).await?;
        if job.get_status() != Some(JobStatus::AwaitingApproval) {
            return Err(Error::validation(format!(
                "job {job_id} is not awaiting approval (status {})",
                job.status
            )));
        }

        let now = Utc::now();
        match decision {
            ApprovalDecision::Approve => {
                exempt_parked_time(&mut job, now);
                job.stage = JobStage::Upload.as_str().to_string();
                job.stage_entered_at = now.to_rfc3339();
                job.status = JobStatus::Pending.as_str().to_string();
                job.updated_at = now.to_rfc3339();
                self.repo.update_job(&job).await?;
                self.repo
                    .add_log(&job.id, &JobLogEntry::info("approved; queued for upload"))
                    .await?;
                info!(job_id, "job approved");
            }
            ApprovalDecision::Reject => {
                let message = match reason {
                    Some(reason) => format!("rejected by reviewer: {reason}"),
                    None => "rejected by reviewer".to_string(),
                };
                job.push_error(JobErrorEntry::new(
                    JobStage::HumanApproval,
                    Error::ApprovalRejected(message.clone()).kind(),
                    message.clone(),
                ))?;
                job.status = JobStatus::Failed.as_str().to_string();
                job.completed_at = Some(now.to_rfc3339());
                job.updated_at = now.to_rfc3339();
                self.repo.update_job(&job).await?;
                self.repo
                    .add_log(&job.id, &JobLogEntry::warn(message))
                    .await?;
                info!(job_id, "job rejected");
            }
        }

        Ok(job)
    }
}

/// Shift `started_at` forward by the time the job sat parked, so the
/// recorded processing duration covers pipeline work only.
fn exempt_parked_time(job: &mut JobDbModel, now: DateTime<Utc>) {
    let parked_at = DateTime::parse_from_rfc3339(&job.stage_entered_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);
    let parked_for = now - parked_at;
    if let Some(started) = job.started_at.as_deref()
        && let Ok(started) = DateTime::parse_from_rfc3339(started)
    {
        job.started_at = Some((started.with_timezone(&Utc) + parked_for).to_rfc3339());
    }
}
