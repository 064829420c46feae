//! Channel database model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Channel database model.
/// An upload destination with its own niche, schedule, branding, and quota
/// state. Long-lived; never deleted while a non-terminal job references it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelDbModel {
    pub id: String,
    pub name: String,
    /// Content niche (e.g. "technology", "finance").
    pub niche: String,
    /// Quality tier: STANDARD, PREMIUM
    pub tier: String,
    /// JSON blob: weekday -> ["HH:MM", ...] upload slots (UTC).
    pub upload_schedule: String,
    /// JSON blob for branding configuration.
    pub branding: String,
    /// Uploads performed on `upload_count_date`.
    pub daily_upload_count: i32,
    /// UTC date (YYYY-MM-DD) the daily counter belongs to.
    pub upload_count_date: String,
    /// ISO 8601 timestamp of the most recent upload.
    pub last_upload_at: Option<String>,
    /// ISO 8601 timestamp when created.
    pub created_at: String,
    /// ISO 8601 timestamp when last updated.
    pub updated_at: String,
}

impl ChannelDbModel {
    /// Create a new channel with default schedule and branding.
    pub fn new(id: impl Into<String>, name: impl Into<String>, niche: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            niche: niche.into(),
            tier: QualityTier::Standard.as_str().to_string(),
            upload_schedule: serde_json::to_string(&UploadSchedule::default())
                .unwrap_or_else(|_| "{}".to_string()),
            branding: serde_json::to_string(&ChannelBranding::default())
                .unwrap_or_else(|_| "{}".to_string()),
            daily_upload_count: 0,
            upload_count_date: now.format("%Y-%m-%d").to_string(),
            last_upload_at: None,
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    pub fn with_tier(mut self, tier: QualityTier) -> Self {
        self.tier = tier.as_str().to_string();
        self
    }

    pub fn get_tier(&self) -> Option<QualityTier> {
        QualityTier::parse(&self.tier)
    }

    /// Parse the schedule blob, falling back to the default schedule.
    pub fn schedule(&self) -> UploadSchedule {
        serde_json::from_str(&self.upload_schedule).unwrap_or_default()
    }

    /// Parse the branding blob, falling back to defaults.
    pub fn get_branding(&self) -> ChannelBranding {
        serde_json::from_str(&self.branding).unwrap_or_default()
    }
}

/// Channel quality tiers. Premium channels gate content at a higher
/// threshold.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    #[default]
    Standard,
    Premium,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Premium => "PREMIUM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STANDARD" => Some(Self::Standard),
            "PREMIUM" => Some(Self::Premium),
            _ => None,
        }
    }
}

/// Upload slots per weekday, times as "HH:MM" in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadSchedule {
    pub slots: BTreeMap<String, Vec<String>>,
}

impl UploadSchedule {
    /// Slots configured for the given weekday.
    pub fn slots_for(&self, weekday: chrono::Weekday) -> &[String] {
        let key = weekday_key(weekday);
        self.slots.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parse a "HH:MM" slot into a time of day.
    pub fn parse_slot(slot: &str) -> Option<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(slot, "%H:%M").ok()
    }
}

fn weekday_key(weekday: chrono::Weekday) -> &'static str {
    match weekday {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}

impl Default for UploadSchedule {
    fn default() -> Self {
        let weekday_slots = vec!["09:00".to_string(), "13:00".to_string(), "18:00".to_string()];
        let weekend_slots = vec!["10:00".to_string(), "14:00".to_string()];

        let mut slots = BTreeMap::new();
        for day in ["monday", "tuesday", "wednesday", "thursday", "friday"] {
            slots.insert(day.to_string(), weekday_slots.clone());
        }
        for day in ["saturday", "sunday"] {
            slots.insert(day.to_string(), weekend_slots.clone());
        }

        Self { slots }
    }
}

/// Branding configuration applied during assembly and voiceover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBranding {
    #[serde(default = "default_intro")]
    pub intro_template: String,
    #[serde(default = "default_outro")]
    pub outro_template: String,
    #[serde(default = "default_watermark")]
    pub watermark: String,
    #[serde(default = "default_color_scheme")]
    pub color_scheme: String,
    #[serde(default = "default_voice")]
    pub voice_id: String,
}

fn default_intro() -> String {
    "default_intro.mp4".to_string()
}

fn default_outro() -> String {
    "default_outro.png".to_string()
}

fn default_watermark() -> String {
    "channel_logo.png".to_string()
}

fn default_color_scheme() -> String {
    "#FF0000".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

impl Default for ChannelBranding {
    fn default() -> Self {
        Self {
            intro_template: default_intro(),
            outro_template: default_outro(),
            watermark: default_watermark(),
            color_scheme: default_color_scheme(),
            voice_id: default_voice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_new() {
        let channel = ChannelDbModel::new("tech", "Tech Shorts", "technology");
        assert_eq!(channel.tier, "STANDARD");
        assert_eq!(channel.daily_upload_count, 0);
        assert!(channel.get_tier().is_some());
    }

    #[test]
    fn test_tier_roundtrip() {
        assert_eq!(QualityTier::parse("PREMIUM"), Some(QualityTier::Premium));
        assert_eq!(QualityTier::parse("STANDARD"), Some(QualityTier::Standard));
        assert_eq!(QualityTier::parse("EXPRESS"), None);
    }

    #[test]
    fn test_default_schedule() {
        let schedule = UploadSchedule::default();
        assert_eq!(schedule.slots_for(chrono::Weekday::Mon).len(), 3);
        assert_eq!(schedule.slots_for(chrono::Weekday::Sun).len(), 2);
    }

    #[test]
    fn test_slot_parsing() {
        assert!(UploadSchedule::parse_slot("09:00").is_some());
        assert!(UploadSchedule::parse_slot("23:59").is_some());
        assert!(UploadSchedule::parse_slot("25:00").is_none());
        assert!(UploadSchedule::parse_slot("late morning").is_none());
    }

    #[test]
    fn test_branding_defaults_fill_missing_fields() {
        let branding: ChannelBranding = serde_json::from_str(r#"{"voice_id": "narrator-2"}"#).unwrap();
        assert_eq!(branding.voice_id, "narrator-2");
        assert_eq!(branding.watermark, "channel_logo.png");
    }

    #[test]
    fn test_schedule_blob_roundtrip() {
        let channel = ChannelDbModel::new("tech", "Tech Shorts", "technology");
        let schedule = channel.schedule();
        assert!(!schedule.slots.is_empty());
    }
}
