//! Stock-style asset backend backed by the local asset library.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::Result;
use crate::providers::{AssetKind, AssetProvider, AssetRef, AssetRequest, Provider};

use super::{SIMPLE_PROVIDER_NAME, slug};

/// Asset backend that resolves keywords to paths under the local asset
/// library. It only builds references; nothing is checked on disk, the
/// assembly step treats missing files as plain backgrounds.
#[derive(Debug)]
pub struct SimpleAssetProvider {
    library_dir: PathBuf,
}

impl SimpleAssetProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: data_dir.into().join("assets"),
        }
    }
}

impl Provider for SimpleAssetProvider {
    fn name(&self) -> &str {
        SIMPLE_PROVIDER_NAME
    }
}

const KIND_ROTATION: [(AssetKind, &str); 3] = [
    (AssetKind::Image, "png"),
    (AssetKind::Clip, "mp4"),
    (AssetKind::Music, "mp3"),
];

#[async_trait]
impl AssetProvider for SimpleAssetProvider {
    async fn gather(&self, request: &AssetRequest) -> Result<Vec<AssetRef>> {
        let keywords: Vec<&str> = request
            .keywords
            .iter()
            .map(|k| k.as_str())
            .filter(|k| !k.trim().is_empty())
            .collect();

        let count = request.count.max(1) as usize;
        let mut refs = Vec::with_capacity(count);
        for i in 0..count {
            let keyword = if keywords.is_empty() {
                "background"
            } else {
                keywords[i % keywords.len()]
            };
            let (kind, ext) = KIND_ROTATION[i % KIND_ROTATION.len()];
            let file = format!("{}-{}.{ext}", slug(keyword), i / KIND_ROTATION.len());
            refs.push(AssetRef {
                kind,
                path: self
                    .library_dir
                    .join(kind.to_string())
                    .join(file)
                    .to_string_lossy()
                    .into_owned(),
                description: keyword.to_string(),
            });
        }

        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gather_cycles_keywords_and_kinds() {
        let provider = SimpleAssetProvider::new("data");
        let refs = provider
            .gather(&AssetRequest {
                keywords: vec!["city lights".to_string(), "coffee".to_string()],
                count: 5,
            })
            .await
            .unwrap();

        assert_eq!(refs.len(), 5);
        assert_eq!(refs[0].kind, AssetKind::Image);
        assert_eq!(refs[1].kind, AssetKind::Clip);
        assert_eq!(refs[2].kind, AssetKind::Music);
        assert!(refs[0].path.ends_with("city-lights-0.png"));
        assert!(refs[1].path.ends_with("coffee-0.mp4"));
        // Second rotation bumps the file index.
        assert!(refs[3].path.ends_with("coffee-1.png"));
    }

    #[tokio::test]
    async fn test_gather_without_keywords_falls_back() {
        let provider = SimpleAssetProvider::new("data");
        let refs = provider
            .gather(&AssetRequest {
                keywords: vec![],
                count: 2,
            })
            .await
            .unwrap();

        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.description == "background"));
    }
}
