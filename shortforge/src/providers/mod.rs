//! Provider abstraction: the five content capabilities and their payloads.
//!
//! Each capability is a small async trait; concrete backends are registered
//! with the [`factory::ProviderRegistry`], which walks an ordered candidate
//! chain under circuit breaker control. The `simple` module ships the
//! deterministic last-resort backends that keep the pipeline producible with
//! no external services at all.

pub mod factory;
pub mod simple;

pub use factory::ProviderRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::database::models::{ChannelBranding, QualityTier};

/// The five content-production capabilities.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Trend,
    Script,
    Asset,
    Voiceover,
    Video,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trend => "trend",
            Self::Script => "script",
            Self::Asset => "asset",
            Self::Voiceover => "voiceover",
            Self::Video => "video",
        }
    }
}

/// Base contract shared by every provider backend.
pub trait Provider: Send + Sync {
    /// Stable backend name, used for circuit breaker keys and logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendRequest {
    pub topic: String,
    pub niche: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub topic: String,
    pub niche: String,
    pub tier: QualityTier,
    /// Target spoken length of the finished short.
    pub target_duration_secs: u32,
}

/// One bounded auto-improvement pass over a previously generated script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveRequest {
    pub script: Script,
    /// The quality gate's weakest sub-scores, phrased as actionable feedback.
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRequest {
    /// Search terms derived from the script.
    pub keywords: Vec<String>,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceoverRequest {
    pub text: String,
    pub voice_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub job_id: String,
    pub title: String,
    pub script: Script,
    pub assets: Vec<AssetRef>,
    pub voiceover: VoiceoverArtifact,
    pub branding: ChannelBranding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailRequest {
    pub job_id: String,
    pub title: String,
    pub branding: ChannelBranding,
}

// ============================================================================
// Payloads
// ============================================================================

/// Result of a trend check for a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    pub topic: String,
    pub trending: bool,
    /// Relative momentum in `[0, 1]`.
    pub momentum: f64,
    pub related_topics: Vec<String>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

/// A short-form video script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    /// Opening line that has to stop the scroll.
    pub hook: String,
    pub body: String,
    pub call_to_action: String,
    pub hashtags: Vec<String>,
}

impl Script {
    /// The script as spoken, hook to call-to-action.
    pub fn full_text(&self) -> String {
        format!("{}\n\n{}\n\n{}", self.hook, self.body, self.call_to_action)
    }

    pub fn word_count(&self) -> usize {
        self.full_text().split_whitespace().count()
    }

    /// Rough spoken duration at the given pace.
    pub fn estimated_duration_secs(&self, words_per_second: f64) -> f64 {
        if words_per_second <= 0.0 {
            return 0.0;
        }
        self.word_count() as f64 / words_per_second
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Clip,
    Music,
}

/// Reference to one gathered B-roll asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub kind: AssetKind,
    pub path: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceoverArtifact {
    pub audio_path: String,
    pub duration_secs: f64,
    pub voice_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub video_path: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailArtifact {
    pub path: String,
    pub headline: String,
}

/// A payload together with the name of the backend that produced it.
///
/// The pipeline records the serving provider on the job so a fallback to a
/// secondary backend is visible in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOutput<T> {
    pub provider: String,
    pub value: T,
}

// ============================================================================
// Capability traits
// ============================================================================

#[async_trait]
pub trait TrendProvider: Provider {
    async fn check_trend(&self, request: &TrendRequest) -> Result<TrendReport>;
}

#[async_trait]
pub trait ScriptProvider: Provider {
    async fn generate(&self, request: &ScriptRequest) -> Result<Script>;

    /// Rework an existing script according to quality gate feedback.
    async fn improve(&self, request: &ImproveRequest) -> Result<Script>;
}

#[async_trait]
pub trait AssetProvider: Provider {
    async fn gather(&self, request: &AssetRequest) -> Result<Vec<AssetRef>>;
}

#[async_trait]
pub trait VoiceoverProvider: Provider {
    async fn synthesize(&self, request: &VoiceoverRequest) -> Result<VoiceoverArtifact>;
}

#[async_trait]
pub trait VideoProvider: Provider {
    async fn assemble(&self, request: &VideoRequest) -> Result<VideoArtifact>;

    /// Produce the cover image for an assembled video.
    async fn render_thumbnail(&self, request: &ThumbnailRequest) -> Result<ThumbnailArtifact>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_script() -> Script {
        Script {
            title: "Five Rust Habits".to_string(),
            hook: "Stop writing Rust like it's C.".to_string(),
            body: "Habit one: let the type system work for you.".to_string(),
            call_to_action: "Follow for more Rust tips.".to_string(),
            hashtags: vec!["#rust".to_string()],
        }
    }

    #[test]
    fn test_script_text_helpers() {
        let script = sample_script();
        assert_eq!(script.word_count(), 20);
        assert!(script.full_text().starts_with("Stop writing"));
        assert!(script.full_text().ends_with("tips."));

        let secs = script.estimated_duration_secs(2.5);
        assert!((secs - 8.0).abs() < 0.01);
        assert_eq!(script.estimated_duration_secs(0.0), 0.0);
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::Voiceover.as_str(), "voiceover");
        assert_eq!(Capability::Trend.to_string(), "trend");
        assert_eq!("video".parse::<Capability>(), Ok(Capability::Video));
        assert!("nonsense".parse::<Capability>().is_err());
    }
}
