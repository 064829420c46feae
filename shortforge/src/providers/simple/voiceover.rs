//! Offline voiceover backend.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::Result;
use crate::providers::{Provider, VoiceoverArtifact, VoiceoverProvider, VoiceoverRequest};

use super::{SIMPLE_PROVIDER_NAME, stable_hash};

/// Voiceover backend that estimates timing from the text instead of
/// synthesizing audio. The assembly step treats the referenced file as
/// silence when it does not exist.
#[derive(Debug)]
pub struct SimpleVoiceoverProvider {
    output_dir: PathBuf,
    words_per_second: f64,
}

impl SimpleVoiceoverProvider {
    pub fn new(data_dir: impl Into<PathBuf>, words_per_second: f64) -> Self {
        Self {
            output_dir: data_dir.into().join("voiceovers"),
            words_per_second,
        }
    }
}

impl Provider for SimpleVoiceoverProvider {
    fn name(&self) -> &str {
        SIMPLE_PROVIDER_NAME
    }
}

#[async_trait]
impl VoiceoverProvider for SimpleVoiceoverProvider {
    async fn synthesize(&self, request: &VoiceoverRequest) -> Result<VoiceoverArtifact> {
        let words = request.text.split_whitespace().count();
        let duration_secs = if self.words_per_second > 0.0 {
            words as f64 / self.words_per_second
        } else {
            0.0
        };

        let voice_id = if request.voice_id.trim().is_empty() {
            "default".to_string()
        } else {
            request.voice_id.clone()
        };

        let file = format!("{:016x}.wav", stable_hash(&request.text));
        Ok(VoiceoverArtifact {
            audio_path: self.output_dir.join(file).to_string_lossy().into_owned(),
            duration_secs,
            voice_id,
        })
    }
}
