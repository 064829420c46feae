//! Upload boundary and per-channel quota enforcement.
//!
//! The quota check and the counter update race when two jobs finish for the
//! same channel at the same time, so both happen under a per-channel async
//! lock held by the caller for the whole reload-check-upload-record span.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::Result;
use crate::config::UploadConfig;
use crate::database::models::ChannelDbModel;
use crate::providers::VideoArtifact;

/// Publishing boundary. Implementations own the destination protocol.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Publish the video for the channel and return the external video id.
    async fn upload(
        &self,
        video: &VideoArtifact,
        channel: &ChannelDbModel,
        title: &str,
    ) -> Result<String>;
}

/// Uploader that archives finished videos locally instead of publishing.
/// Stands in for a real platform uploader in tests and offline runs.
pub struct LocalArchiveUploader {
    archive_dir: PathBuf,
}

impl LocalArchiveUploader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: data_dir.into().join("uploaded"),
        }
    }
}

#[derive(Serialize)]
struct UploadRecord<'a> {
    external_id: &'a str,
    channel_id: &'a str,
    channel_name: &'a str,
    title: &'a str,
    video_path: &'a str,
    duration_secs: f64,
    uploaded_at: DateTime<Utc>,
}

#[async_trait]
impl Uploader for LocalArchiveUploader {
    async fn upload(
        &self,
        video: &VideoArtifact,
        channel: &ChannelDbModel,
        title: &str,
    ) -> Result<String> {
        let external_id = format!("loc-{}", Uuid::new_v4().simple());
        fs::create_dir_all(&self.archive_dir).await?;

        let record = UploadRecord {
            external_id: &external_id,
            channel_id: &channel.id,
            channel_name: &channel.name,
            title,
            video_path: &video.video_path,
            duration_secs: video.duration_secs,
            uploaded_at: Utc::now(),
        };
        let path = self.archive_dir.join(format!("{external_id}.json"));
        fs::write(&path, serde_json::to_vec_pretty(&record)?).await?;

        info!(%external_id, channel_id = %channel.id, "video archived as uploaded");
        Ok(external_id)
    }
}

/// Quota verdict for one channel at one instant.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadGate {
    Clear,
    /// Quota blocks the upload; retry no earlier than `until`.
    Deferred {
        until: DateTime<Utc>,
        reason: String,
    },
}

/// Serializes quota checks and counter updates per channel.
pub struct ChannelUploadGovernor {
    config: UploadConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChannelUploadGovernor {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            locks: DashMap::new(),
        }
    }

    /// Take the channel's upload lock. Hold the guard across the quota
    /// check, the upload call, and the counter update.
    pub async fn acquire(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Quota verdict from the channel's persisted counters. Call with a
    /// freshly loaded row while holding the channel's lock.
    pub fn evaluate(&self, channel: &ChannelDbModel, now: DateTime<Utc>) -> UploadGate {
        let today = now.format("%Y-%m-%d").to_string();
        if channel.upload_count_date == today
            && channel.daily_upload_count >= self.config.max_daily_uploads as i32
        {
            return UploadGate::Deferred {
                until: next_utc_midnight(now),
                reason: format!(
                    "daily cap of {} uploads reached",
                    self.config.max_daily_uploads
                ),
            };
        }

        if let Some(last) = channel.last_upload_at.as_deref()
            && let Ok(last) = DateTime::parse_from_rfc3339(last)
        {
            let next_allowed = last.with_timezone(&Utc)
                + ChronoDuration::seconds(self.config.min_upload_interval_seconds as i64);
            if next_allowed > now {
                return UploadGate::Deferred {
                    until: next_allowed,
                    reason: format!(
                        "minimum upload interval of {}s not elapsed",
                        self.config.min_upload_interval_seconds
                    ),
                };
            }
        }

        UploadGate::Clear
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(chrono::Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .unwrap_or_else(|| now + ChronoDuration::hours(24))
}
