//! Stage execution engine.
//!
//! Runs one job through the production stages, persisting after every
//! transition so a crash resumes at the last completed stage. Transient
//! failures retry the current stage with exponential backoff; fatal ones
//! fail the job immediately. The engine never blocks a worker slot on a
//! human: reaching `HUMAN_APPROVAL` parks the job and returns.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::ApprovalGateway;
use crate::config::AppConfig;
use crate::database::models::{
    JobArtifacts, JobDbModel, JobErrorEntry, JobLogEntry, JobStage, JobStatus, VideoDbModel,
};
use crate::database::repositories::{ChannelRepository, JobRepository, VideoRepository};
use crate::providers::{
    AssetRequest, ImproveRequest, ProviderRegistry, Script, ScriptRequest, ThumbnailRequest,
    TrendRequest, VideoRequest, VoiceoverRequest,
};
use crate::quality::{GateDecision, QualityEvaluation, QualityGate};
use crate::resilience::RetryPolicy;
use crate::upload::{ChannelUploadGovernor, UploadGate, Uploader};
use crate::{Error, Result};

/// How many B-roll assets to gather per video.
const ASSETS_PER_VIDEO: u32 = 6;

/// How a dispatch ended. Terminal states are already persisted when this is
/// returned; `Parked` and `Deferred` expect the caller to release the worker
/// slot (and, for deferrals, to re-admit the job).
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Job reached `DONE`; the video is uploaded.
    Succeeded,
    /// Job parked at `HUMAN_APPROVAL` waiting for a reviewer.
    Parked,
    /// Channel upload window is closed; dispatch again after `until`.
    Deferred { until: DateTime<Utc> },
    /// Job is `FAILED`.
    Failed,
    /// Cancellation was observed; job is `CANCELLED`.
    Cancelled,
}

/// What a single stage asked for.
enum StageOutcome {
    /// Move to the next stage in order.
    Next,
    /// Jump to a specific stage (quality gate rework).
    Goto(JobStage),
    /// Park awaiting human approval.
    Park,
    /// Defer the upload until the channel window reopens.
    Defer { until: DateTime<Utc> },
}

/// The stage executor. One shared instance drives every worker; per-channel
/// upload locks live in the governor, so sharing is required for quota
/// correctness.
pub struct PipelineEngine {
    config: AppConfig,
    registry: Arc<ProviderRegistry>,
    gate: QualityGate,
    governor: ChannelUploadGovernor,
    uploader: Arc<dyn Uploader>,
    approvals: ApprovalGateway,
    retry_policy: RetryPolicy,
    job_repo: Arc<dyn JobRepository>,
    channel_repo: Arc<dyn ChannelRepository>,
    video_repo: Arc<dyn VideoRepository>,
}

impl PipelineEngine {
    pub fn new(
        config: AppConfig,
        registry: Arc<ProviderRegistry>,
        uploader: Arc<dyn Uploader>,
        job_repo: Arc<dyn JobRepository>,
        channel_repo: Arc<dyn ChannelRepository>,
        video_repo: Arc<dyn VideoRepository>,
    ) -> Self {
        let retry_policy = RetryPolicy {
            max_retries: config.pipeline.retry_attempts,
            initial_delay_ms: config.pipeline.retry_initial_delay_ms,
            max_delay_ms: config.pipeline.retry_max_delay_ms,
            ..RetryPolicy::default()
        };
        Self {
            gate: QualityGate::new(config.quality.clone()),
            governor: ChannelUploadGovernor::new(config.upload.clone()),
            approvals: ApprovalGateway::new(job_repo.clone()),
            retry_policy,
            config,
            registry,
            uploader,
            job_repo,
            channel_repo,
            video_repo,
        }
    }

    /// Run a claimed job until it parks, defers, or reaches a terminal
    /// state. An `Err` here means persistence itself failed; the job row is
    /// left as-is for the next recovery pass.
    pub async fn run(&self, mut job: JobDbModel, token: CancellationToken) -> Result<RunOutcome> {
        info!(job_id = %job.id, stage = %job.stage, topic = %job.topic, "job dispatched");
        loop {
            if token.is_cancelled() {
                return self.finish_cancelled(&mut job).await;
            }

            let stage = match job.get_stage() {
                Some(stage) => stage,
                None => {
                    let err = Error::validation(format!("unknown stage {:?}", job.stage));
                    return self.finish_failed(&mut job, JobStage::TrendCheck, err).await;
                }
            };
            if stage == JobStage::Done {
                return self.finish_succeeded(&mut job).await;
            }

            debug!(job_id = %job.id, stage = %stage, "running stage");
            match self.execute_with_retry(&mut job, stage, &token).await {
                Ok(StageOutcome::Next) => {
                    let next = stage.next().unwrap_or(JobStage::Done);
                    self.enter_stage(&mut job, next).await?;
                }
                Ok(StageOutcome::Goto(target)) => {
                    self.enter_stage(&mut job, target).await?;
                }
                Ok(StageOutcome::Park) => return Ok(RunOutcome::Parked),
                Ok(StageOutcome::Defer { until }) => return Ok(RunOutcome::Deferred { until }),
                Err(Error::Cancelled(_)) => return self.finish_cancelled(&mut job).await,
                Err(err) => return self.finish_failed(&mut job, stage, err).await,
            }
        }
    }

    /// Run one stage, retrying transient failures with backoff. Every
    /// failure lands in the job's error history; the terminal one is also
    /// returned.
    async fn execute_with_retry(
        &self,
        job: &mut JobDbModel,
        stage: JobStage,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        loop {
            let err = match self.run_stage(job, stage, token).await {
                Ok(outcome) => return Ok(outcome),
                Err(err @ Error::Cancelled(_)) => return Err(err),
                Err(err) => err,
            };

            job.push_error(JobErrorEntry::new(stage, err.kind(), err.to_string()))?;
            if !err.is_retryable() || !self.retry_policy.should_retry(job.retry_count as u32) {
                self.job_repo.update_job(job).await?;
                return Err(err);
            }

            job.retry_count += 1;
            self.job_repo.update_job(job).await?;
            let delay = self.retry_policy.delay_for_attempt(job.retry_count as u32);
            warn!(
                job_id = %job.id,
                stage = %stage,
                attempt = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage failed; backing off"
            );
            self.job_repo
                .add_log(
                    &job.id,
                    &JobLogEntry::warn(format!(
                        "stage {stage} attempt {} failed: {err}; retrying",
                        job.retry_count
                    )),
                )
                .await?;

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Cancelled("cancelled during retry backoff".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_stage(
        &self,
        job: &mut JobDbModel,
        stage: JobStage,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        match stage {
            JobStage::TrendCheck => self.stage_trend_check(job, token).await,
            JobStage::ScriptGen => self.stage_script_gen(job, token).await,
            JobStage::QualityCheck => self.stage_quality_check(job).await,
            JobStage::AssetGather => self.stage_asset_gather(job, token).await,
            JobStage::Voiceover => self.stage_voiceover(job, token).await,
            JobStage::VideoAssembly => self.stage_video_assembly(job, token).await,
            JobStage::Thumbnail => self.stage_thumbnail(job, token).await,
            JobStage::HumanApproval => self.stage_human_approval(job).await,
            JobStage::Upload => self.stage_upload(job).await,
            // The run loop exits before dispatching DONE.
            JobStage::Done => Ok(StageOutcome::Next),
        }
    }

    async fn stage_trend_check(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let request = TrendRequest {
            topic: job.topic.clone(),
            niche: channel.niche.clone(),
        };
        let report = self
            .bounded("trend check", token, self.registry.check_trend(&request))
            .await?;
        // Momentum is advisory; it informs scheduling, not a gate here.
        info!(
            job_id = %job.id,
            provider = %report.provider,
            momentum = report.value.momentum,
            "trend checked"
        );

        let mut artifacts = job.get_artifacts();
        artifacts.trend = Some(report);
        job.set_artifacts(&artifacts)?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    async fn stage_script_gen(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let tier = channel.get_tier().unwrap_or_default();
        let mut artifacts = job.get_artifacts();

        let output = match artifacts.script.as_ref() {
            Some(previous) if job.improve_count > 0 => {
                let request = ImproveRequest {
                    script: previous.value.clone(),
                    feedback: self.stored_feedback(job),
                };
                self.bounded(
                    "script improvement",
                    token,
                    self.registry.improve_script(&request),
                )
                .await?
            }
            _ => {
                let request = ScriptRequest {
                    topic: job.topic.clone(),
                    niche: channel.niche.clone(),
                    tier,
                    target_duration_secs: self.config.quality.target_duration_secs,
                };
                self.bounded(
                    "script generation",
                    token,
                    self.registry.generate_script(&request),
                )
                .await?
            }
        };

        info!(
            job_id = %job.id,
            provider = %output.provider,
            words = output.value.word_count(),
            improved = job.improve_count > 0,
            "script ready"
        );
        artifacts.script = Some(output);
        job.set_artifacts(&artifacts)?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    /// Score the script and route it: advance, one improvement pass, or
    /// fail. The full evaluation is persisted on the job either way.
    async fn stage_quality_check(&self, job: &mut JobDbModel) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let tier = channel.get_tier().unwrap_or_default();
        let artifacts = job.get_artifacts();
        let Some(script) = artifacts.script.as_ref() else {
            return Err(Error::validation("quality check reached without a script"));
        };

        let evaluation = self.gate.evaluate(&script.value, tier);
        job.quality_score = Some(evaluation.composite);
        job.quality_detail = Some(serde_json::to_string(&evaluation)?);
        self.job_repo.update_job(job).await?;
        self.job_repo
            .add_log(
                &job.id,
                &JobLogEntry::info(format!(
                    "quality score {:.1}, decision {}",
                    evaluation.composite, evaluation.decision
                )),
            )
            .await?;

        match evaluation.decision {
            GateDecision::AutoApprove => Ok(StageOutcome::Next),
            GateDecision::AutoImprove if job.improve_count == 0 => {
                job.improve_count = 1;
                info!(
                    job_id = %job.id,
                    score = evaluation.composite,
                    "below threshold; sending script back for one improvement pass"
                );
                Ok(StageOutcome::Goto(JobStage::ScriptGen))
            }
            GateDecision::AutoImprove => Err(Error::QualityRejected {
                score: evaluation.composite,
                reason: format!(
                    "score {:.1} still below threshold {:.1} after improvement",
                    evaluation.composite, evaluation.effective_threshold
                ),
            }),
            GateDecision::Reject => Err(Error::QualityRejected {
                score: evaluation.composite,
                reason: evaluation.reject_reason(),
            }),
        }
    }

    async fn stage_asset_gather(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let mut artifacts = job.get_artifacts();
        let Some(script) = artifacts.script.as_ref() else {
            return Err(Error::validation("asset gathering reached without a script"));
        };

        let request = AssetRequest {
            keywords: asset_keywords(&script.value, &job.topic),
            count: ASSETS_PER_VIDEO,
        };
        let output = self
            .bounded(
                "asset gathering",
                token,
                self.registry.gather_assets(&request),
            )
            .await?;
        info!(
            job_id = %job.id,
            provider = %output.provider,
            assets = output.value.len(),
            "assets gathered"
        );

        artifacts.assets = Some(output);
        job.set_artifacts(&artifacts)?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    async fn stage_voiceover(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let mut artifacts = job.get_artifacts();
        let Some(script) = artifacts.script.as_ref() else {
            return Err(Error::validation("voiceover reached without a script"));
        };

        let request = VoiceoverRequest {
            text: script.value.full_text(),
            voice_id: channel.get_branding().voice_id,
        };
        let output = self
            .bounded(
                "voiceover synthesis",
                token,
                self.registry.synthesize_voiceover(&request),
            )
            .await?;
        info!(
            job_id = %job.id,
            provider = %output.provider,
            duration_secs = output.value.duration_secs,
            "voiceover synthesized"
        );

        artifacts.voiceover = Some(output);
        job.set_artifacts(&artifacts)?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    async fn stage_video_assembly(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let mut artifacts = job.get_artifacts();
        let (Some(script), Some(assets), Some(voiceover)) = (
            artifacts.script.as_ref(),
            artifacts.assets.as_ref(),
            artifacts.voiceover.as_ref(),
        ) else {
            return Err(Error::validation(
                "video assembly reached without script, assets and voiceover",
            ));
        };

        let request = VideoRequest {
            job_id: job.id.clone(),
            title: script.value.title.clone(),
            script: script.value.clone(),
            assets: assets.value.clone(),
            voiceover: voiceover.value.clone(),
            branding: channel.get_branding(),
        };
        let output = self
            .bounded(
                "video assembly",
                token,
                self.registry.assemble_video(&request),
            )
            .await?;
        info!(
            job_id = %job.id,
            provider = %output.provider,
            path = %output.value.video_path,
            "video assembled"
        );

        artifacts.video = Some(output);
        job.set_artifacts(&artifacts)?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    async fn stage_thumbnail(
        &self,
        job: &mut JobDbModel,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let mut artifacts = job.get_artifacts();
        let title = artifacts.title().unwrap_or(&job.topic).to_string();

        let request = ThumbnailRequest {
            job_id: job.id.clone(),
            title: title.clone(),
            branding: channel.get_branding(),
        };
        let output = self
            .bounded(
                "thumbnail rendering",
                token,
                self.registry.render_thumbnail(&request),
            )
            .await?;
        info!(
            job_id = %job.id,
            provider = %output.provider,
            path = %output.value.path,
            "thumbnail rendered"
        );

        artifacts.thumbnail = Some(output);
        job.set_artifacts(&artifacts)?;
        self.record_video(job, &artifacts, &title).await?;
        self.job_repo.update_job(job).await?;
        Ok(StageOutcome::Next)
    }

    /// Park the job for review. The slot is released by returning; the
    /// approval gateway later re-queues the job at `UPLOAD`.
    async fn stage_human_approval(&self, job: &mut JobDbModel) -> Result<StageOutcome> {
        self.approvals.request(job).await?;
        Ok(StageOutcome::Park)
    }

    /// Upload under the per-channel lock: quota math and the upload itself
    /// are serialized so concurrent jobs cannot both sneak under the cap.
    async fn stage_upload(&self, job: &mut JobDbModel) -> Result<StageOutcome> {
        let mut artifacts = job.get_artifacts();
        let Some(video) = artifacts.video.clone() else {
            return Err(Error::validation("upload reached without an assembled video"));
        };
        let title = artifacts.title().unwrap_or(&job.topic).to_string();

        let _guard = self.governor.acquire(&job.channel_id).await;
        let channel = self.channel_repo.get_channel(&job.channel_id).await?;
        let now = Utc::now();

        match self.governor.evaluate(&channel, now) {
            UploadGate::Deferred { until, reason } => {
                job.status = JobStatus::Deferred.as_str().to_string();
                job.not_before = Some(until.to_rfc3339());
                job.updated_at = now.to_rfc3339();
                self.job_repo.update_job(job).await?;
                self.job_repo
                    .add_log(
                        &job.id,
                        &JobLogEntry::info(format!("upload deferred until {until}: {reason}")),
                    )
                    .await?;
                info!(job_id = %job.id, %until, reason, "upload deferred");
                Ok(StageOutcome::Defer { until })
            }
            UploadGate::Clear => {
                let external_id = self.uploader.upload(&video.value, &channel, &title).await?;
                let uploaded_at = Utc::now();
                self.channel_repo
                    .record_upload(
                        &channel.id,
                        &uploaded_at.to_rfc3339(),
                        &uploaded_at.format("%Y-%m-%d").to_string(),
                    )
                    .await?;
                if let Some(row) = self.video_repo.get_video_for_job(&job.id).await? {
                    self.video_repo
                        .mark_uploaded(&row.id, &external_id, &uploaded_at.to_rfc3339())
                        .await?;
                }

                artifacts.external_video_id = Some(external_id.clone());
                job.set_artifacts(&artifacts)?;
                self.job_repo.update_job(job).await?;
                info!(job_id = %job.id, external_id, channel_id = %channel.id, "video uploaded");
                Ok(StageOutcome::Next)
            }
        }
    }

    /// Write the video catalog row once assembly artifacts are complete.
    /// Re-runs after a crash must not duplicate it.
    async fn record_video(
        &self,
        job: &JobDbModel,
        artifacts: &JobArtifacts,
        title: &str,
    ) -> Result<()> {
        if self.video_repo.get_video_for_job(&job.id).await?.is_some() {
            return Ok(());
        }
        let (Some(script), Some(video), Some(thumbnail)) = (
            artifacts.script.as_ref(),
            artifacts.video.as_ref(),
            artifacts.thumbnail.as_ref(),
        ) else {
            return Ok(());
        };

        let mut record = VideoDbModel::new(
            &job.id,
            &job.channel_id,
            title,
            script.value.full_text(),
            &video.value.video_path,
            video.value.duration_secs,
        )
        .with_thumbnail(&thumbnail.value.path);
        if let Some(score) = job.quality_score {
            record = record.with_quality_score(score);
        }
        self.video_repo.create_video(&record).await?;
        Ok(())
    }

    /// Feedback from the persisted quality evaluation, for an improve pass.
    fn stored_feedback(&self, job: &JobDbModel) -> Vec<String> {
        job.quality_detail
            .as_deref()
            .and_then(|raw| serde_json::from_str::<QualityEvaluation>(raw).ok())
            .map(|evaluation| evaluation.feedback)
            .unwrap_or_default()
    }

    /// Wrap a provider call with the per-stage timeout and the job's
    /// cancellation token.
    async fn bounded<T>(
        &self,
        operation: &str,
        token: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.stage_timeout();
        tokio::select! {
            _ = token.cancelled() => {
                Err(Error::Cancelled(format!("cancelled during {operation}")))
            }
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(operation, timeout.as_secs())),
            },
        }
    }

    async fn enter_stage(&self, job: &mut JobDbModel, stage: JobStage) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        job.stage = stage.as_str().to_string();
        job.stage_entered_at = now.clone();
        job.retry_count = 0;
        job.updated_at = now;
        self.job_repo.update_job(job).await?;
        Ok(())
    }

    async fn finish_succeeded(&self, job: &mut JobDbModel) -> Result<RunOutcome> {
        let now = Utc::now().to_rfc3339();
        job.status = JobStatus::Succeeded.as_str().to_string();
        job.completed_at = Some(now.clone());
        job.updated_at = now;
        self.job_repo.update_job(job).await?;
        self.job_repo
            .add_log(&job.id, &JobLogEntry::info("job completed; video uploaded"))
            .await?;
        info!(job_id = %job.id, "job succeeded");
        Ok(RunOutcome::Succeeded)
    }

    async fn finish_failed(
        &self,
        job: &mut JobDbModel,
        stage: JobStage,
        err: Error,
    ) -> Result<RunOutcome> {
        let now = Utc::now().to_rfc3339();
        job.status = JobStatus::Failed.as_str().to_string();
        job.completed_at = Some(now.clone());
        job.updated_at = now;
        self.job_repo.update_job(job).await?;
        self.job_repo
            .add_log(
                &job.id,
                &JobLogEntry::error(format!("job failed at {stage}: {err}")),
            )
            .await?;
        warn!(job_id = %job.id, stage = %stage, error = %err, "job failed");
        Ok(RunOutcome::Failed)
    }

    async fn finish_cancelled(&self, job: &mut JobDbModel) -> Result<RunOutcome> {
        let now = Utc::now().to_rfc3339();
        job.status = JobStatus::Cancelled.as_str().to_string();
        job.completed_at = Some(now.clone());
        job.updated_at = now;
        self.job_repo.update_job(job).await?;
        self.job_repo
            .add_log(&job.id, &JobLogEntry::warn("cancelled during execution"))
            .await?;
        info!(job_id = %job.id, "job cancelled");
        Ok(RunOutcome::Cancelled)
    }
}

/// Search terms for B-roll: the topic first, then script hashtags (minus
/// the generic ones).
fn asset_keywords(script: &Script, topic: &str) -> Vec<String> {
    let mut keywords = vec![topic.to_string()];
    for tag in &script.hashtags {
        let tag = tag.trim_start_matches('#');
        if !tag.is_empty() && tag != "shorts" && !keywords.iter().any(|k| k == tag) {
            keywords.push(tag.to_string());
        }
    }
    keywords.truncate(5);
    keywords
}
