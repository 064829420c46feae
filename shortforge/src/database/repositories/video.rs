//! Video repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{Pagination, VideoDbModel};
use crate::database::with_busy_retry;
use crate::{Error, Result};

/// Video repository trait.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Create a new video record.
    async fn create_video(&self, video: &VideoDbModel) -> Result<()>;

    /// Get a video by ID.
    async fn get_video(&self, id: &str) -> Result<VideoDbModel>;

    /// Get the video produced by a job, if any.
    async fn get_video_for_job(&self, job_id: &str) -> Result<Option<VideoDbModel>>;

    /// List a channel's videos, newest first.
    async fn list_videos_for_channel(
        &self,
        channel_id: &str,
        page: &Pagination,
    ) -> Result<Vec<VideoDbModel>>;

    /// Count a channel's videos.
    async fn count_videos_for_channel(&self, channel_id: &str) -> Result<u64>;

    /// Record a completed upload against a video.
    async fn mark_uploaded(&self, id: &str, external_id: &str, uploaded_at: &str) -> Result<()>;
}

/// SQLx implementation of VideoRepository.
pub struct SqlxVideoRepository {
    pool: SqlitePool,
}

impl SqlxVideoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRepository for SqlxVideoRepository {
    async fn create_video(&self, video: &VideoDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO videos (
                id, job_id, channel_id, title, script,
                video_path, thumbnail_path, duration_secs, quality_score,
                external_video_id, uploaded_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&video.id)
        .bind(&video.job_id)
        .bind(&video.channel_id)
        .bind(&video.title)
        .bind(&video.script)
        .bind(&video.video_path)
        .bind(&video.thumbnail_path)
        .bind(video.duration_secs)
        .bind(video.quality_score)
        .bind(&video.external_video_id)
        .bind(&video.uploaded_at)
        .bind(&video.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_video(&self, id: &str) -> Result<VideoDbModel> {
        sqlx::query_as::<_, VideoDbModel>("SELECT * FROM videos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Video", id))
    }

    async fn get_video_for_job(&self, job_id: &str) -> Result<Option<VideoDbModel>> {
        let video = sqlx::query_as::<_, VideoDbModel>("SELECT * FROM videos WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(video)
    }

    async fn list_videos_for_channel(
        &self,
        channel_id: &str,
        page: &Pagination,
    ) -> Result<Vec<VideoDbModel>> {
        let videos = sqlx::query_as::<_, VideoDbModel>(
            r#"
            SELECT * FROM videos
            WHERE channel_id = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(channel_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(videos)
    }

    async fn count_videos_for_channel(&self, channel_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn mark_uploaded(&self, id: &str, external_id: &str, uploaded_at: &str) -> Result<()> {
        with_busy_retry("mark_uploaded", || async {
            let result = sqlx::query(
                "UPDATE videos SET external_video_id = ?, uploaded_at = ? WHERE id = ?",
            )
            .bind(external_id)
            .bind(uploaded_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(Error::not_found("Video", id));
            }
            Ok(())
        })
        .await
    }
}
