//! Video record database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Video database model.
/// One row per assembled video, written when assembly completes and updated
/// when the upload succeeds. Kept for reporting and audit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VideoDbModel {
    pub id: String,
    /// Job that produced this video.
    pub job_id: String,
    pub channel_id: String,
    pub title: String,
    /// Final script text the voiceover was synthesized from.
    pub script: String,
    pub video_path: String,
    pub thumbnail_path: Option<String>,
    pub duration_secs: f64,
    /// Composite quality score at the time the script passed the gate.
    pub quality_score: Option<f64>,
    /// Identifier assigned by the upload destination, once uploaded.
    pub external_video_id: Option<String>,
    /// ISO 8601 timestamp of the successful upload.
    pub uploaded_at: Option<String>,
    /// ISO 8601 timestamp when created.
    pub created_at: String,
}

impl VideoDbModel {
    pub fn new(
        job_id: impl Into<String>,
        channel_id: impl Into<String>,
        title: impl Into<String>,
        script: impl Into<String>,
        video_path: impl Into<String>,
        duration_secs: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            channel_id: channel_id.into(),
            title: title.into(),
            script: script.into(),
            video_path: video_path.into(),
            thumbnail_path: None,
            duration_secs,
            quality_score: None,
            external_video_id: None,
            uploaded_at: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_thumbnail(mut self, path: impl Into<String>) -> Self {
        self.thumbnail_path = Some(path.into());
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    /// Record a successful upload.
    pub fn mark_uploaded(&mut self, external_video_id: impl Into<String>) {
        self.external_video_id = Some(external_video_id.into());
        self.uploaded_at = Some(chrono::Utc::now().to_rfc3339());
    }
}
