//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job database model.
/// One row per content-production job; rich state (artifacts, error history,
/// logs) is stored as JSON blobs and given structure by the pipeline layer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Topic the video is produced about.
    pub topic: String,
    /// Owning channel id.
    pub channel_id: String,
    /// Stage: TREND_CHECK .. UPLOAD, DONE
    pub stage: String,
    /// Status: PENDING, RUNNING, AWAITING_APPROVAL, DEFERRED, SUCCEEDED, FAILED, CANCELLED
    pub status: String,
    /// Priority: LOW, NORMAL, HIGH, CRITICAL
    pub priority: String,
    /// Retries consumed by the current stage.
    pub retry_count: i32,
    /// Auto-improvement cycles consumed by the quality gate.
    pub improve_count: i32,
    /// Composite quality score, once evaluated.
    pub quality_score: Option<f64>,
    /// JSON blob of the full quality evaluation (sub-scores + decision).
    pub quality_detail: Option<String>,
    /// JSON blob of accumulated artifacts.
    pub artifacts: String,
    /// JSON blob of the ordered error history.
    pub error_history: String,
    /// Most recent error message, for quick listing.
    pub error: Option<String>,
    /// ISO 8601 timestamp when the job was created.
    pub created_at: String,
    /// ISO 8601 timestamp when the job was last updated.
    pub updated_at: String,
    /// ISO 8601 timestamp when the current stage was entered.
    pub stage_entered_at: String,
    /// ISO 8601 timestamp when the job first started running.
    pub started_at: Option<String>,
    /// ISO 8601 timestamp when the job reached a terminal status.
    pub completed_at: Option<String>,
    /// ISO 8601 timestamp before which a deferred job must not be dispatched.
    pub not_before: Option<String>,
}

impl JobDbModel {
    pub fn new(topic: impl Into<String>, channel_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            channel_id: channel_id.into(),
            stage: JobStage::TrendCheck.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            priority: JobPriority::Normal.as_str().to_string(),
            retry_count: 0,
            improve_count: 0,
            quality_score: None,
            quality_detail: None,
            artifacts: "{}".to_string(),
            error_history: "[]".to_string(),
            error: None,
            created_at: now.clone(),
            updated_at: now.clone(),
            stage_entered_at: now,
            started_at: None,
            completed_at: None,
            not_before: None,
        }
    }

    pub fn get_stage(&self) -> Option<JobStage> {
        JobStage::parse(&self.stage)
    }

    pub fn get_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn get_priority(&self) -> Option<JobPriority> {
        JobPriority::parse(&self.priority)
    }

    /// Parse the artifacts blob. Unreadable blobs surface as empty artifacts.
    pub fn get_artifacts(&self) -> JobArtifacts {
        serde_json::from_str(&self.artifacts).unwrap_or_default()
    }

    pub fn set_artifacts(&mut self, artifacts: &JobArtifacts) -> crate::Result<()> {
        self.artifacts = serde_json::to_string(artifacts)?;
        Ok(())
    }

    /// Parse the ordered error history blob.
    pub fn get_error_history(&self) -> Vec<JobErrorEntry> {
        serde_json::from_str(&self.error_history).unwrap_or_default()
    }

    /// Append to the error history and refresh the quick-access `error`
    /// column.
    pub fn push_error(&mut self, entry: JobErrorEntry) -> crate::Result<()> {
        self.error = Some(entry.message.clone());
        let mut history = self.get_error_history();
        history.push(entry);
        self.error_history = serde_json::to_string(&history)?;
        Ok(())
    }
}

/// Accumulated stage outputs, stored in the `artifacts` JSON column. Each
/// entry records the provider that served it, so fallbacks stay visible in
/// the audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobArtifacts {
    pub trend: Option<crate::providers::ProviderOutput<crate::providers::TrendReport>>,
    pub script: Option<crate::providers::ProviderOutput<crate::providers::Script>>,
    pub assets: Option<crate::providers::ProviderOutput<Vec<crate::providers::AssetRef>>>,
    pub voiceover: Option<crate::providers::ProviderOutput<crate::providers::VoiceoverArtifact>>,
    pub video: Option<crate::providers::ProviderOutput<crate::providers::VideoArtifact>>,
    pub thumbnail: Option<crate::providers::ProviderOutput<crate::providers::ThumbnailArtifact>>,
    /// Id assigned by the upload destination once published.
    pub external_video_id: Option<String>,
}

impl JobArtifacts {
    /// Title of the produced video, once a script exists.
    pub fn title(&self) -> Option<&str> {
        self.script.as_ref().map(|s| s.value.title.as_str())
    }
}

/// Pipeline stages in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    TrendCheck,
    ScriptGen,
    QualityCheck,
    AssetGather,
    Voiceover,
    VideoAssembly,
    Thumbnail,
    HumanApproval,
    Upload,
    Done,
}

impl JobStage {
    /// All stages in execution order.
    pub const ORDERED: [JobStage; 10] = [
        Self::TrendCheck,
        Self::ScriptGen,
        Self::QualityCheck,
        Self::AssetGather,
        Self::Voiceover,
        Self::VideoAssembly,
        Self::Thumbnail,
        Self::HumanApproval,
        Self::Upload,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendCheck => "TREND_CHECK",
            Self::ScriptGen => "SCRIPT_GEN",
            Self::QualityCheck => "QUALITY_CHECK",
            Self::AssetGather => "ASSET_GATHER",
            Self::Voiceover => "VOICEOVER",
            Self::VideoAssembly => "VIDEO_ASSEMBLY",
            Self::Thumbnail => "THUMBNAIL",
            Self::HumanApproval => "HUMAN_APPROVAL",
            Self::Upload => "UPLOAD",
            Self::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDERED.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Position in the fixed stage order.
    pub fn index(&self) -> usize {
        Self::ORDERED
            .iter()
            .position(|stage| stage == self)
            .unwrap_or(0)
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Self> {
        Self::ORDERED.get(self.index() + 1).copied()
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is queued and waiting to be picked up by a worker.
    Pending,
    /// Job is currently being executed.
    Running,
    /// Job is parked pending a human decision; holds no worker slot.
    AwaitingApproval,
    /// Upload was postponed (channel quota); invisible to dispatch until
    /// `not_before` passes.
    Deferred,
    /// Job finished successfully and its video was uploaded.
    Succeeded,
    /// Job failed after exhausting retries, or fatally.
    Failed,
    /// Job was cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Deferred => "DEFERRED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "AWAITING_APPROVAL" => Some(Self::AwaitingApproval),
            "DEFERRED" => Some(Self::Deferred),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Job priority tiers. Ordering is by urgency; the queue ages waiting jobs
/// upward so lower tiers cannot starve.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "NORMAL" => Some(Self::Normal),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric rank used for ordering and aging arithmetic.
    pub fn rank(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// One entry in a job's ordered error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorEntry {
    /// Stage the error occurred in.
    pub stage: String,
    /// Stable error kind identifier (see `Error::kind`).
    pub kind: String,
    /// Human-readable reason.
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl JobErrorEntry {
    pub fn new(stage: JobStage, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.as_str().to_string(),
            kind: kind.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Log level for job execution logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A single log entry for job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Row model for the `job_logs` table.
///
/// `entry` is a JSON-encoded [`JobLogEntry`].
#[derive(Debug, Clone, FromRow)]
pub struct JobLogDbModel {
    pub id: String,
    pub job_id: String,
    pub entry: String,
    pub created_at: String,
}

impl JobLogDbModel {
    pub fn new(job_id: &str, entry: &JobLogEntry) -> crate::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            entry: serde_json::to_string(entry)?,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn get_entry(&self) -> crate::Result<JobLogEntry> {
        Ok(serde_json::from_str(&self.entry)?)
    }
}

impl JobLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub status: Option<JobStatus>,
    pub channel_id: Option<String>,
    pub stage: Option<JobStage>,
}

/// Per-status job counts, as returned by `JobRepository::job_counts`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatusCounts {
    pub pending: u64,
    pub running: u64,
    pub awaiting_approval: u64,
    pub deferred: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStatusCounts {
    /// Jobs that still need worker attention at some point.
    pub fn active(&self) -> u64 {
        self.pending + self.running + self.awaiting_approval + self.deferred
    }
}

/// Pagination parameters.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
