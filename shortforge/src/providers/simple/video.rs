//! Manifest-based assembly backend.
//!
//! Rendering real video needs an external toolchain, so this backend writes a
//! JSON manifest describing the cut instead. A render farm (or a human with
//! an editor) can turn the manifest into footage later; the rest of the
//! pipeline only needs the artifact paths and timing.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;

use crate::Result;
use crate::providers::{
    AssetRef, Provider, ThumbnailArtifact, ThumbnailRequest, VideoArtifact, VideoProvider,
    VideoRequest,
};

use super::SIMPLE_PROVIDER_NAME;

/// Vertical short-form frame.
const FRAME_WIDTH: u32 = 1080;
const FRAME_HEIGHT: u32 = 1920;

/// Lead-in plus outro card around the voiceover.
const PADDING_SECS: f64 = 3.5;

const MAX_HEADLINE_CHARS: usize = 40;

#[derive(Debug)]
pub struct SimpleVideoProvider {
    data_dir: PathBuf,
}

impl SimpleVideoProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl Provider for SimpleVideoProvider {
    fn name(&self) -> &str {
        SIMPLE_PROVIDER_NAME
    }
}

#[derive(Serialize)]
struct VideoManifest<'a> {
    job_id: &'a str,
    title: &'a str,
    width: u32,
    height: u32,
    duration_secs: f64,
    voiceover_path: &'a str,
    assets: &'a [AssetRef],
    intro: &'a str,
    outro: &'a str,
    watermark: &'a str,
    captions: Vec<&'a str>,
}

#[derive(Serialize)]
struct ThumbnailManifest<'a> {
    job_id: &'a str,
    headline: &'a str,
    color_scheme: &'a str,
    watermark: &'a str,
    width: u32,
    height: u32,
}

#[async_trait]
impl VideoProvider for SimpleVideoProvider {
    async fn assemble(&self, request: &VideoRequest) -> Result<VideoArtifact> {
        let duration_secs = request.voiceover.duration_secs + PADDING_SECS;
        let dir = self.data_dir.join("videos");
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", request.job_id));

        let captions = request
            .script
            .full_text()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let manifest = VideoManifest {
            job_id: &request.job_id,
            title: &request.title,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            duration_secs,
            voiceover_path: &request.voiceover.audio_path,
            assets: &request.assets,
            intro: &request.branding.intro_template,
            outro: &request.branding.outro_template,
            watermark: &request.branding.watermark,
            captions: captions.iter().map(String::as_str).collect(),
        };
        fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;

        Ok(VideoArtifact {
            video_path: path.to_string_lossy().into_owned(),
            duration_secs,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
        })
    }

    async fn render_thumbnail(&self, request: &ThumbnailRequest) -> Result<ThumbnailArtifact> {
        let headline = headline_from_title(&request.title);
        let dir = self.data_dir.join("thumbnails");
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", request.job_id));

        let manifest = ThumbnailManifest {
            job_id: &request.job_id,
            headline: &headline,
            color_scheme: &request.branding.color_scheme,
            watermark: &request.branding.watermark,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
        };
        fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;

        Ok(ThumbnailArtifact {
            path: path.to_string_lossy().into_owned(),
            headline,
        })
    }
}

/// Thumbnail text: the title uppercased and cut at a word boundary.
fn headline_from_title(title: &str) -> String {
    let mut headline = String::new();
    for word in title.split_whitespace() {
        if !headline.is_empty() && headline.len() + 1 + word.len() > MAX_HEADLINE_CHARS {
            break;
        }
        if !headline.is_empty() {
            headline.push(' ');
        }
        headline.push_str(word);
    }
    if headline.is_empty() {
        headline = title.chars().take(MAX_HEADLINE_CHARS).collect();
    }
    headline.to_uppercase()
}
