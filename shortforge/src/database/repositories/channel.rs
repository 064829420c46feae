//! Channel repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ChannelDbModel;
use crate::database::with_busy_retry;
use crate::{Error, Result};

/// Channel repository trait.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// Create a new channel record.
    async fn create_channel(&self, channel: &ChannelDbModel) -> Result<()>;

    /// Get a channel by ID.
    async fn get_channel(&self, id: &str) -> Result<ChannelDbModel>;

    /// List all channels, alphabetically.
    async fn list_channels(&self) -> Result<Vec<ChannelDbModel>>;

    /// Persist the mutable portion of a channel row.
    async fn update_channel(&self, channel: &ChannelDbModel) -> Result<()>;

    /// Record a completed upload: bumps the daily counter, resetting it first
    /// when the UTC date has rolled over, and stamps `last_upload_at`.
    async fn record_upload(&self, id: &str, uploaded_at: &str, date: &str) -> Result<()>;

    /// Delete a channel.
    async fn delete_channel(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of ChannelRepository.
pub struct SqlxChannelRepository {
    pool: SqlitePool,
}

impl SqlxChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for SqlxChannelRepository {
    async fn create_channel(&self, channel: &ChannelDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (
                id, name, niche, tier, upload_schedule, branding,
                daily_upload_count, upload_count_date, last_upload_at,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(&channel.niche)
        .bind(&channel.tier)
        .bind(&channel.upload_schedule)
        .bind(&channel.branding)
        .bind(channel.daily_upload_count)
        .bind(&channel.upload_count_date)
        .bind(&channel.last_upload_at)
        .bind(&channel.created_at)
        .bind(&channel.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_channel(&self, id: &str) -> Result<ChannelDbModel> {
        sqlx::query_as::<_, ChannelDbModel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Channel", id))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelDbModel>> {
        let channels =
            sqlx::query_as::<_, ChannelDbModel>("SELECT * FROM channels ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(channels)
    }

    async fn update_channel(&self, channel: &ChannelDbModel) -> Result<()> {
        with_busy_retry("update_channel", || async {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                UPDATE channels SET
                    name = ?,
                    niche = ?,
                    tier = ?,
                    upload_schedule = ?,
                    branding = ?,
                    daily_upload_count = ?,
                    upload_count_date = ?,
                    last_upload_at = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&channel.name)
            .bind(&channel.niche)
            .bind(&channel.tier)
            .bind(&channel.upload_schedule)
            .bind(&channel.branding)
            .bind(channel.daily_upload_count)
            .bind(&channel.upload_count_date)
            .bind(&channel.last_upload_at)
            .bind(&now)
            .bind(&channel.id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn record_upload(&self, id: &str, uploaded_at: &str, date: &str) -> Result<()> {
        with_busy_retry("record_upload", || async {
            // The CASE resets the counter when the stored date is stale, so the
            // increment and the date rollover stay in one statement.
            let result = sqlx::query(
                r#"
                UPDATE channels SET
                    daily_upload_count = CASE
                        WHEN upload_count_date = ?2 THEN daily_upload_count + 1
                        ELSE 1
                    END,
                    upload_count_date = ?2,
                    last_upload_at = ?3,
                    updated_at = ?3
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .bind(date)
            .bind(uploaded_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(Error::not_found("Channel", id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_channel(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_test_pool() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_create_and_list_channels() {
        let pool = setup_test_pool().await;
        let repo = SqlxChannelRepository::new(pool);

        repo.create_channel(&ChannelDbModel::new("tech", "Tech Bites", "technology"))
            .await
            .unwrap();
        repo.create_channel(&ChannelDbModel::new("cook", "Fast Meals", "cooking"))
            .await
            .unwrap();

        let channels = repo.list_channels().await.unwrap();
        assert_eq!(channels.len(), 2);
        // Alphabetical by name.
        assert_eq!(channels[0].name, "Fast Meals");

        let fetched = repo.get_channel("tech").await.unwrap();
        assert_eq!(fetched.niche, "technology");
    }

    #[tokio::test]
    async fn test_record_upload_same_day_increments() {
        let pool = setup_test_pool().await;
        let repo = SqlxChannelRepository::new(pool);

        repo.create_channel(&ChannelDbModel::new("tech", "Tech Bites", "technology"))
            .await
            .unwrap();

        repo.record_upload("tech", "2026-03-01T09:00:00Z", "2026-03-01")
            .await
            .unwrap();
        repo.record_upload("tech", "2026-03-01T13:00:00Z", "2026-03-01")
            .await
            .unwrap();

        let channel = repo.get_channel("tech").await.unwrap();
        assert_eq!(channel.daily_upload_count, 2);
        assert_eq!(channel.upload_count_date, "2026-03-01");
        assert_eq!(
            channel.last_upload_at.as_deref(),
            Some("2026-03-01T13:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_record_upload_date_rollover_resets() {
        let pool = setup_test_pool().await;
        let repo = SqlxChannelRepository::new(pool);

        repo.create_channel(&ChannelDbModel::new("tech", "Tech Bites", "technology"))
            .await
            .unwrap();

        repo.record_upload("tech", "2026-03-01T22:00:00Z", "2026-03-01")
            .await
            .unwrap();
        repo.record_upload("tech", "2026-03-02T09:00:00Z", "2026-03-02")
            .await
            .unwrap();

        let channel = repo.get_channel("tech").await.unwrap();
        assert_eq!(channel.daily_upload_count, 1);
        assert_eq!(channel.upload_count_date, "2026-03-02");
    }

    #[tokio::test]
    async fn test_record_upload_unknown_channel() {
        let pool = setup_test_pool().await;
        let repo = SqlxChannelRepository::new(pool);

        let result = repo
            .record_upload("ghost", "2026-03-01T09:00:00Z", "2026-03-01")
            .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
