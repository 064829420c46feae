//! Offline trend backend.

use async_trait::async_trait;

use crate::Result;
use crate::providers::{Provider, TrendProvider, TrendReport, TrendRequest};

use super::{SIMPLE_PROVIDER_NAME, stable_hash};

/// Trend backend with no data source. Every topic is reported as trending
/// with a momentum derived from a stable hash of the topic, so repeated
/// checks for the same topic agree with each other.
#[derive(Debug, Default)]
pub struct SimpleTrendProvider;

impl SimpleTrendProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for SimpleTrendProvider {
    fn name(&self) -> &str {
        SIMPLE_PROVIDER_NAME
    }
}

#[async_trait]
impl TrendProvider for SimpleTrendProvider {
    async fn check_trend(&self, request: &TrendRequest) -> Result<TrendReport> {
        // Map the hash into [0.35, 0.95) so topics never look dead.
        let momentum = 0.35 + (stable_hash(&request.topic) % 600) as f64 / 1000.0;

        Ok(TrendReport {
            topic: request.topic.clone(),
            trending: true,
            momentum,
            related_topics: vec![
                format!("{} explained", request.topic),
                format!("{} mistakes to avoid", request.topic),
                format!("{} for beginners", request.topic),
            ],
            checked_at: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trend_is_deterministic_and_in_range() {
        let provider = SimpleTrendProvider::new();
        let request = TrendRequest {
            topic: "urban beekeeping".to_string(),
            niche: "lifestyle".to_string(),
        };

        let first = provider.check_trend(&request).await.unwrap();
        let second = provider.check_trend(&request).await.unwrap();

        assert!(first.trending);
        assert_eq!(first.momentum, second.momentum);
        assert!((0.35..0.95).contains(&first.momentum));
        assert_eq!(first.related_topics.len(), 3);
    }
}
