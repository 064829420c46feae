//! Upload-schedule scanner.
//!
//! Each channel carries a weekly grid of `HH:MM` UTC slots. The scheduler
//! scans the grid once per tick and enqueues one generation job per slot
//! that has come due, so content is ready ahead of the channel's posting
//! rhythm. It also runs the daily retention cleanup for terminal jobs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::{SchedulerConfig, UploadConfig};
use crate::database::models::{ChannelDbModel, JobPriority, UploadSchedule};
use crate::database::repositories::{ChannelRepository, JobRepository};
use crate::pipeline::PipelineManager;

/// Background service that turns channel upload slots into queued jobs.
pub struct UploadScheduler {
    config: SchedulerConfig,
    upload: UploadConfig,
    manager: Arc<PipelineManager>,
    channel_repo: Arc<dyn ChannelRepository>,
    job_repo: Arc<dyn JobRepository>,
    state: parking_lot::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    /// Most recent slot fired per channel, keyed by channel id. A slot only
    /// fires when it is strictly later than this mark, which is what keeps
    /// one slot from firing twice across ticks.
    last_fired: HashMap<String, NaiveDateTime>,
    /// UTC date the retention cleanup last ran for.
    last_cleanup_date: String,
}

impl UploadScheduler {
    pub fn new(
        config: SchedulerConfig,
        upload: UploadConfig,
        manager: Arc<PipelineManager>,
        channel_repo: Arc<dyn ChannelRepository>,
        job_repo: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            config,
            upload,
            manager,
            channel_repo,
            job_repo,
            state: parking_lot::Mutex::new(SchedulerState::default()),
        }
    }

    /// Mark every slot up to `now` as already fired, without enqueuing.
    /// Called once at startup so a daemon booted at 20:00 does not replay
    /// the whole day's slots.
    pub async fn prime(&self, now: DateTime<Utc>) -> Result<()> {
        let channels = self.channel_repo.list_channels().await?;
        let mut state = self.state.lock();
        for channel in &channels {
            if let Some(latest) = latest_due_slot(channel, now) {
                state.last_fired.insert(channel.id.clone(), latest);
            }
        }
        state.last_cleanup_date = now.format("%Y-%m-%d").to_string();
        Ok(())
    }

    /// One scan over all channels. Returns how many jobs were enqueued.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let channels = self.channel_repo.list_channels().await?;
        let today = now.format("%Y-%m-%d").to_string();
        let mut enqueued = 0usize;

        for channel in &channels {
            let Some(due) = latest_due_slot(channel, now) else {
                continue;
            };
            {
                let state = self.state.lock();
                if let Some(last) = state.last_fired.get(&channel.id)
                    && *last >= due
                {
                    continue;
                }
            }

            if channel.upload_count_date == today
                && channel.daily_upload_count >= self.upload.max_daily_uploads as i32
            {
                info!(
                    channel_id = %channel.id,
                    slot = %due.format("%H:%M"),
                    "channel at daily cap, skipping slot"
                );
                self.state.lock().last_fired.insert(channel.id.clone(), due);
                continue;
            }

            match self
                .manager
                .create_job(&channel.niche, &channel.id, JobPriority::Normal)
                .await
            {
                Ok(job_id) => {
                    info!(
                        channel_id = %channel.id,
                        job_id = %job_id,
                        slot = %due.format("%H:%M"),
                        "scheduled generation job for upload slot"
                    );
                    self.state.lock().last_fired.insert(channel.id.clone(), due);
                    enqueued += 1;
                }
                Err(e) => {
                    // Queue full or channel vanished; the slot stays
                    // unmarked so the next tick retries it.
                    warn!(channel_id = %channel.id, "failed to schedule job: {e}");
                }
            }
        }

        self.run_daily_cleanup(&today).await;
        Ok(enqueued)
    }

    /// Delete terminal jobs past the retention window, once per UTC day.
    async fn run_daily_cleanup(&self, today: &str) {
        if self.config.retention_days == 0 {
            return;
        }
        {
            let state = self.state.lock();
            if state.last_cleanup_date == today {
                return;
            }
        }

        match self.job_repo.cleanup_old_jobs(self.config.retention_days).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(
                        "Cleaned up {} jobs older than {} days",
                        deleted, self.config.retention_days
                    );
                }
                self.state.lock().last_cleanup_date = today.to_string();
            }
            Err(e) => error!("job cleanup failed: {e}"),
        }
    }

    /// Start the background scan task.
    pub fn start_background_task(self: Arc<Self>, cancellation_token: CancellationToken) {
        if !self.config.enabled {
            info!("Scheduler disabled");
            return;
        }

        tokio::spawn(async move {
            if let Err(e) = self.prime(Utc::now()).await {
                error!("failed to prime scheduler: {e}");
            }

            let mut tick = interval(Duration::from_secs(self.config.tick_seconds));
            info!(
                "Scheduler started (tick: {}s, retention: {} days)",
                self.config.tick_seconds, self.config.retention_days
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Scheduler shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.scan_once(Utc::now()).await {
                            error!("schedule scan failed: {e}");
                        }
                    }
                }
            }
        });
    }
}

/// The latest slot on the channel's grid that is not after `now`, looking
/// at today only. Slots are `HH:MM` UTC; unparseable slots are skipped.
fn latest_due_slot(channel: &ChannelDbModel, now: DateTime<Utc>) -> Option<NaiveDateTime> {
    let schedule = channel.schedule();
    let today = now.date_naive();
    let now_time = now.time();

    schedule
        .slots_for(now.weekday())
        .iter()
        .filter_map(|slot| UploadSchedule::parse_slot(slot))
        .filter(|time| *time <= now_time)
        .max()
        .map(|time| today.and_time(time))
}
