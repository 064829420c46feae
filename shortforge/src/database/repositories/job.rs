//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    JobDbModel, JobFilters, JobLogDbModel, JobLogEntry, JobStatus, JobStatusCounts, Pagination,
};
use crate::database::with_busy_retry;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a new job record.
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;

    /// Get a job by ID.
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;

    /// Persist the mutable portion of a job row.
    async fn update_job(&self, job: &JobDbModel) -> Result<()>;

    /// Update only a job's status.
    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()>;

    /// List jobs with optional status, channel and stage filters.
    async fn list_jobs(&self, filters: &JobFilters, page: &Pagination) -> Result<Vec<JobDbModel>>;

    /// Count jobs matching the same filters as [`Self::list_jobs`].
    async fn count_jobs(&self, filters: &JobFilters) -> Result<u64>;

    /// List all jobs in a given status, newest first.
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;

    /// List jobs that survive a restart: pending, deferred and jobs parked
    /// for human approval, oldest first.
    async fn list_active_jobs(&self) -> Result<Vec<JobDbModel>>;

    /// Move jobs stranded in RUNNING back to PENDING. Returns how many rows changed.
    async fn reset_running_jobs(&self) -> Result<u64>;

    /// Per-status job counts.
    async fn job_counts(&self) -> Result<JobStatusCounts>;

    /// Delete terminal jobs older than the retention window. Returns how many
    /// rows were deleted.
    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<u64>;

    /// Delete a job and its execution logs.
    async fn delete_job(&self, id: &str) -> Result<()>;

    // Execution logs
    async fn add_log(&self, job_id: &str, entry: &JobLogEntry) -> Result<()>;
    async fn get_logs(&self, job_id: &str) -> Result<Vec<JobLogDbModel>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, topic, channel_id, stage, status, priority,
                retry_count, improve_count, quality_score, quality_detail,
                artifacts, error_history, error,
                created_at, updated_at, stage_entered_at,
                started_at, completed_at, not_before
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.topic)
        .bind(&job.channel_id)
        .bind(&job.stage)
        .bind(&job.status)
        .bind(&job.priority)
        .bind(job.retry_count)
        .bind(job.improve_count)
        .bind(job.quality_score)
        .bind(&job.quality_detail)
        .bind(&job.artifacts)
        .bind(&job.error_history)
        .bind(&job.error)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .bind(&job.stage_entered_at)
        .bind(&job.started_at)
        .bind(&job.completed_at)
        .bind(&job.not_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn update_job(&self, job: &JobDbModel) -> Result<()> {
        with_busy_retry("update_job", || async {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                UPDATE jobs SET
                    stage = ?,
                    status = ?,
                    priority = ?,
                    retry_count = ?,
                    improve_count = ?,
                    quality_score = ?,
                    quality_detail = ?,
                    artifacts = ?,
                    error_history = ?,
                    error = ?,
                    updated_at = ?,
                    stage_entered_at = ?,
                    started_at = ?,
                    completed_at = ?,
                    not_before = ?
                WHERE id = ?
                "#,
            )
            .bind(&job.stage)
            .bind(&job.status)
            .bind(&job.priority)
            .bind(job.retry_count)
            .bind(job.improve_count)
            .bind(job.quality_score)
            .bind(&job.quality_detail)
            .bind(&job.artifacts)
            .bind(&job.error_history)
            .bind(&job.error)
            .bind(&now)
            .bind(&job.stage_entered_at)
            .bind(&job.started_at)
            .bind(&job.completed_at)
            .bind(&job.not_before)
            .bind(&job.id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        with_busy_retry("update_job_status", || async {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_jobs(&self, filters: &JobFilters, page: &Pagination) -> Result<Vec<JobDbModel>> {
        let sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            filter_clause(filters)
        );

        let mut query = sqlx::query_as::<_, JobDbModel>(&sql);
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(channel_id) = &filters.channel_id {
            query = query.bind(channel_id);
        }
        if let Some(stage) = filters.stage {
            query = query.bind(stage.as_str());
        }
        query = query.bind(page.limit).bind(page.offset);

        let jobs = query.fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn count_jobs(&self, filters: &JobFilters) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM jobs {}", filter_clause(filters));

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(channel_id) = &filters.channel_id {
            query = query.bind(channel_id);
        }
        if let Some(stage) = filters.stage {
            query = query.bind(stage.as_str());
        }

        let count = query.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_active_jobs(&self) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('PENDING', 'DEFERRED', 'AWAITING_APPROVAL')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn reset_running_jobs(&self) -> Result<u64> {
        with_busy_retry("reset_running_jobs", || async {
            let now = chrono::Utc::now().to_rfc3339();
            let result = sqlx::query(
                "UPDATE jobs SET status = 'PENDING', updated_at = ? WHERE status = 'RUNNING'",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn job_counts(&self) -> Result<JobStatusCounts> {
        #[derive(sqlx::FromRow)]
        struct StatusCount {
            status: String,
            count: i64,
        }

        let rows: Vec<StatusCount> =
            sqlx::query_as("SELECT status, COUNT(*) as count FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobStatusCounts::default();
        for StatusCount { status, count } in rows {
            match status.as_str() {
                "PENDING" => counts.pending = count as u64,
                "RUNNING" => counts.running = count as u64,
                "AWAITING_APPROVAL" => counts.awaiting_approval = count as u64,
                "DEFERRED" => counts.deferred = count as u64,
                "SUCCEEDED" => counts.succeeded = count as u64,
                "FAILED" => counts.failed = count as u64,
                "CANCELLED" => counts.cancelled = count as u64,
                _ => {}
            }
        }

        Ok(counts)
    }

    async fn cleanup_old_jobs(&self, retention_days: u32) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        sqlx::query(
            r#"
            DELETE FROM job_logs
            WHERE job_id IN (
                SELECT id FROM jobs
                WHERE status IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
                AND updated_at < ?
            )
            "#,
        )
        .bind(&cutoff_str)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
            AND updated_at < ?
            "#,
        )
        .bind(&cutoff_str)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        // Execution logs are deleted via CASCADE
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_log(&self, job_id: &str, entry: &JobLogEntry) -> Result<()> {
        let log = JobLogDbModel::new(job_id, entry)?;
        sqlx::query(
            r#"
            INSERT INTO job_logs (id, job_id, entry, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.job_id)
        .bind(&log.entry)
        .bind(&log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs(&self, job_id: &str) -> Result<Vec<JobLogDbModel>> {
        let logs = sqlx::query_as::<_, JobLogDbModel>(
            "SELECT * FROM job_logs WHERE job_id = ? ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}

/// Build the WHERE clause for [`JobFilters`]. Bind order must match:
/// status, channel_id, stage.
fn filter_clause(filters: &JobFilters) -> String {
    let mut conditions: Vec<&'static str> = Vec::new();
    if filters.status.is_some() {
        conditions.push("status = ?");
    }
    if filters.channel_id.is_some() {
        conditions.push("channel_id = ?");
    }
    if filters.stage.is_some() {
        conditions.push("stage = ?");
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}
