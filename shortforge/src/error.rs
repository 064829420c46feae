//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// The provider/pipeline variants (`ProviderUnavailable`, `ProviderFatal`,
/// `QualityRejected`, `Timeout`, `ApprovalRejected`, `CapacityExceeded`) are
/// the job-facing taxonomy recorded in a job's error history; the rest are
/// ambient plumbing errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No provider available for {capability}: {reason}")]
    ProviderUnavailable { capability: String, reason: String },

    #[error("Provider {provider} failed fatally: {reason}")]
    ProviderFatal { provider: String, reason: String },

    #[error("Quality gate rejected content (score {score:.1}): {reason}")]
    QualityRejected { score: f64, reason: String },

    #[error("Timed out after {seconds}s during {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn provider_unavailable(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    pub fn provider_fatal(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderFatal {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    /// Whether the pipeline may retry the failed stage.
    ///
    /// Fatal provider errors, quality rejections, and human rejections are
    /// final for the attempt that produced them; everything in the retryable
    /// set is eligible for the engine's bounded retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::Timeout { .. }
                | Self::CapacityExceeded(_)
                | Self::DatabaseSqlx(_)
                | Self::Database(_)
                | Self::Io(_)
        )
    }

    /// Short stable identifier for persistence in a job's error history.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseSqlx(_) | Self::Database(_) => "DATABASE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            Self::ProviderFatal { .. } => "PROVIDER_FATAL",
            Self::QualityRejected { .. } => "QUALITY_REJECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ApprovalRejected(_) => "APPROVAL_REJECTED",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::Cancelled(_) => "CANCELLED",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Io(_) => "IO",
            Self::Other(_) => "OTHER",
        }
    }
}
