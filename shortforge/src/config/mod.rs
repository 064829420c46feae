//! Application configuration.
//!
//! One explicit configuration tree, constructed once at startup and handed to
//! each component's constructor. Core logic never reads the environment or
//! any global; only [`AppConfig::load`] touches `std::env`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database URL (e.g. "sqlite:shortforge.db?mode=rwc").
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Directory for generated artifacts (voiceovers, manifests, archives).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub providers: ProviderChainConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Job queue and stage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum jobs executing simultaneously.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Maximum jobs admitted to the queue before enqueue backpressures.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Wall-clock deadline for one dispatched run of a job. Approval waits
    /// happen while the job is parked, outside any dispatch, so they are not
    /// counted against this.
    #[serde(default = "default_job_timeout_minutes")]
    pub job_timeout_minutes: u64,

    /// Timeout for a single provider call within a stage.
    #[serde(default = "default_stage_timeout_seconds")]
    pub stage_timeout_seconds: u64,

    /// Retry budget for a retryable stage failure.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Initial backoff delay between stage retries in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Quality gate thresholds and scoring inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Composite score needed for auto-approval on a standard-tier channel.
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,

    /// Floor of the auto-improve band; composites below it are rejected
    /// outright.
    #[serde(default = "default_improve_floor")]
    pub improve_floor: f64,

    /// Added to the effective threshold for premium-tier channels.
    #[serde(default = "default_premium_bonus")]
    pub premium_bonus: f64,

    /// Speaking pace used to judge script length against target duration.
    #[serde(default = "default_words_per_second")]
    pub words_per_second: f64,

    /// Spoken length scripts are generated and judged against.
    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u32,

    /// Terms that reject a script regardless of its composite score.
    #[serde(default = "default_blacklist")]
    pub blacklist: Vec<String>,
}

/// Upload quota enforcement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Per-channel uploads allowed per UTC day.
    #[serde(default = "default_max_daily_uploads")]
    pub max_daily_uploads: u32,

    /// Minimum spacing between two uploads on the same channel, in seconds.
    #[serde(default = "default_min_upload_interval")]
    pub min_upload_interval_seconds: u64,
}

/// Circuit breaker thresholds shared by all provider breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Initial open-state cool-down in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Ceiling for the doubling cool-down in seconds.
    #[serde(default = "default_max_cooldown_seconds")]
    pub max_cooldown_seconds: u64,
}

/// Ordered provider candidates per capability, primary first. Unknown names
/// are rejected at registry build time, not silently skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderChainConfig {
    #[serde(default)]
    pub trend: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub asset: Vec<String>,
    #[serde(default)]
    pub voiceover: Vec<String>,
    #[serde(default)]
    pub video: Vec<String>,

    /// Append the built-in simple backend as the last resort of every chain.
    #[serde(default = "default_true")]
    pub use_simple_fallback: bool,
}

/// Channel schedule scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between schedule scans.
    #[serde(default = "default_scheduler_tick_seconds")]
    pub tick_seconds: u64,

    /// Days to retain terminal jobs before the daily cleanup deletes them.
    /// 0 retains jobs forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_database_url() -> String {
    "sqlite:shortforge.db?mode=rwc".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_job_timeout_minutes() -> u64 {
    15
}

fn default_stage_timeout_seconds() -> u64 {
    120
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30000
}

fn default_min_quality_score() -> f64 {
    70.0
}

fn default_improve_floor() -> f64 {
    50.0
}

fn default_premium_bonus() -> f64 {
    10.0
}

fn default_words_per_second() -> f64 {
    2.5
}

fn default_target_duration_secs() -> u32 {
    45
}

fn default_blacklist() -> Vec<String> {
    ["guaranteed returns", "miracle cure", "get rich quick"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_daily_uploads() -> u32 {
    3
}

fn default_min_upload_interval() -> u64 {
    14400
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_max_cooldown_seconds() -> u64 {
    900
}

fn default_scheduler_tick_seconds() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            pipeline: PipelineConfig::default(),
            quality: QualityConfig::default(),
            upload: UploadConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: ProviderChainConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            queue_capacity: default_queue_capacity(),
            job_timeout_minutes: default_job_timeout_minutes(),
            stage_timeout_seconds: default_stage_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_quality_score: default_min_quality_score(),
            improve_floor: default_improve_floor(),
            premium_bonus: default_premium_bonus(),
            words_per_second: default_words_per_second(),
            target_duration_secs: default_target_duration_secs(),
            blacklist: default_blacklist(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_daily_uploads: default_max_daily_uploads(),
            min_upload_interval_seconds: default_min_upload_interval(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            max_cooldown_seconds: default_max_cooldown_seconds(),
        }
    }
}

impl Default for ProviderChainConfig {
    fn default() -> Self {
        Self {
            trend: Vec::new(),
            script: Vec::new(),
            asset: Vec::new(),
            voiceover: Vec::new(),
            video: Vec::new(),
            use_simple_fallback: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: default_scheduler_tick_seconds(),
            retention_days: default_retention_days(),
        }
    }
}

impl AppConfig {
    /// Load configuration: JSON file if `SHORTFORGE_CONFIG` points at one,
    /// defaults otherwise, then scalar environment overrides on top.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SHORTFORGE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(dir) = std::env::var("SHORTFORGE_DATA_DIR") {
            config.data_dir = dir;
        }
        if let Ok(dir) = std::env::var("SHORTFORGE_LOG_DIR") {
            config.log_dir = dir;
        }
        if let Ok(n) = std::env::var("SHORTFORGE_MAX_CONCURRENT_JOBS")
            && let Ok(n) = n.parse::<usize>()
        {
            config.pipeline.max_concurrent_jobs = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config file: {}", e)))?;
        Ok(config)
    }

    /// Reject inconsistent settings before any component is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent_jobs == 0 {
            return Err(Error::config("max_concurrent_jobs must be at least 1"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be at least 1"));
        }
        if self.pipeline.job_timeout_minutes == 0 {
            return Err(Error::config("job_timeout_minutes must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.quality.min_quality_score) {
            return Err(Error::config("min_quality_score must be within 0..=100"));
        }
        if self.quality.improve_floor > self.quality.min_quality_score {
            return Err(Error::config(
                "improve_floor must not exceed min_quality_score",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config("failure_threshold must be at least 1"));
        }
        if self.circuit_breaker.max_cooldown_seconds < self.circuit_breaker.cooldown_seconds {
            return Err(Error::config(
                "max_cooldown_seconds must be >= cooldown_seconds",
            ));
        }
        if self.upload.max_daily_uploads == 0 {
            return Err(Error::config("max_daily_uploads must be at least 1"));
        }
        Ok(())
    }

    /// Deadline for one dispatched run of a job.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.job_timeout_minutes * 60)
    }

    /// Timeout for a single provider call.
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.stage_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.max_concurrent_jobs, 3);
        assert_eq!(config.pipeline.job_timeout_minutes, 15);
        assert_eq!(config.quality.min_quality_score, 70.0);
        assert_eq!(config.upload.max_daily_uploads, 3);
        assert_eq!(config.upload.min_upload_interval_seconds, 14400);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn improve_floor_above_threshold_rejected() {
        let mut config = AppConfig::default();
        config.quality.improve_floor = 80.0;
        config.quality.min_quality_score = 70.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"pipeline": {"max_concurrent_jobs": 5}}"#).unwrap();
        assert_eq!(config.pipeline.max_concurrent_jobs, 5);
        assert_eq!(config.pipeline.retry_attempts, 3);
        assert_eq!(config.quality.min_quality_score, 70.0);
    }

    #[test]
    fn timeout_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.job_timeout(), Duration::from_secs(15 * 60));
        assert_eq!(config.stage_timeout(), Duration::from_secs(120));
    }
}
