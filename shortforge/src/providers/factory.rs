//! Provider registry: ordered fallback chains under circuit breaker control.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::resilience::{Admission, CircuitBreakerManager, ProviderKey};
use crate::{Error, Result};

use super::simple::{
    SimpleAssetProvider, SimpleScriptProvider, SimpleTrendProvider, SimpleVideoProvider,
    SimpleVoiceoverProvider,
};
use super::{
    AssetProvider, AssetRef, AssetRequest, Capability, ImproveRequest, Provider, ProviderOutput,
    Script, ScriptProvider, ScriptRequest, ThumbnailArtifact, ThumbnailRequest, TrendProvider,
    TrendReport, TrendRequest, VideoArtifact, VideoProvider, VideoRequest, VoiceoverArtifact,
    VoiceoverProvider, VoiceoverRequest,
};

/// Holds the ordered candidate chain for each capability and walks it on
/// every call.
///
/// Chain walk: candidates are tried in registration order; a candidate whose
/// circuit is open is skipped without an attempt; a retryable failure moves
/// on to the next candidate; a fatal failure aborts the whole operation; an
/// exhausted chain surfaces as `ProviderUnavailable`. Every attempt, success
/// or failure, is recorded against that candidate's breaker.
pub struct ProviderRegistry {
    breakers: Arc<CircuitBreakerManager>,
    trend: Vec<Arc<dyn TrendProvider>>,
    script: Vec<Arc<dyn ScriptProvider>>,
    asset: Vec<Arc<dyn AssetProvider>>,
    voiceover: Vec<Arc<dyn VoiceoverProvider>>,
    video: Vec<Arc<dyn VideoProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry. Backends are added with the `register_*`
    /// methods in fallback order, primary first.
    pub fn new(breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            breakers,
            trend: Vec::new(),
            script: Vec::new(),
            asset: Vec::new(),
            voiceover: Vec::new(),
            video: Vec::new(),
        }
    }

    /// Build a registry from configuration, resolving each configured backend
    /// name. When `use_simple_fallback` is set, the always-succeeding simple
    /// backend is appended to any chain that does not already contain it.
    pub fn from_config(config: &AppConfig, breakers: Arc<CircuitBreakerManager>) -> Result<Self> {
        let mut registry = Self::new(breakers);
        let chains = &config.providers;

        for name in with_fallback(&chains.trend, chains.use_simple_fallback) {
            let provider: Arc<dyn TrendProvider> = match name.as_str() {
                "simple" => Arc::new(SimpleTrendProvider::new()),
                other => return Err(unknown_backend(Capability::Trend, other)),
            };
            registry.trend.push(provider);
        }
        for name in with_fallback(&chains.script, chains.use_simple_fallback) {
            let provider: Arc<dyn ScriptProvider> = match name.as_str() {
                "simple" => Arc::new(SimpleScriptProvider::new(config.quality.words_per_second)),
                other => return Err(unknown_backend(Capability::Script, other)),
            };
            registry.script.push(provider);
        }
        for name in with_fallback(&chains.asset, chains.use_simple_fallback) {
            let provider: Arc<dyn AssetProvider> = match name.as_str() {
                "simple" => Arc::new(SimpleAssetProvider::new(&config.data_dir)),
                other => return Err(unknown_backend(Capability::Asset, other)),
            };
            registry.asset.push(provider);
        }
        for name in with_fallback(&chains.voiceover, chains.use_simple_fallback) {
            let provider: Arc<dyn VoiceoverProvider> = match name.as_str() {
                "simple" => Arc::new(SimpleVoiceoverProvider::new(
                    &config.data_dir,
                    config.quality.words_per_second,
                )),
                other => return Err(unknown_backend(Capability::Voiceover, other)),
            };
            registry.voiceover.push(provider);
        }
        for name in with_fallback(&chains.video, chains.use_simple_fallback) {
            let provider: Arc<dyn VideoProvider> = match name.as_str() {
                "simple" => Arc::new(SimpleVideoProvider::new(&config.data_dir)),
                other => return Err(unknown_backend(Capability::Video, other)),
            };
            registry.video.push(provider);
        }

        Ok(registry)
    }

    pub fn register_trend(&mut self, provider: Arc<dyn TrendProvider>) {
        self.trend.push(provider);
    }

    pub fn register_script(&mut self, provider: Arc<dyn ScriptProvider>) {
        self.script.push(provider);
    }

    pub fn register_asset(&mut self, provider: Arc<dyn AssetProvider>) {
        self.asset.push(provider);
    }

    pub fn register_voiceover(&mut self, provider: Arc<dyn VoiceoverProvider>) {
        self.voiceover.push(provider);
    }

    pub fn register_video(&mut self, provider: Arc<dyn VideoProvider>) {
        self.video.push(provider);
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerManager> {
        self.breakers.clone()
    }

    pub async fn check_trend(&self, request: &TrendRequest) -> Result<ProviderOutput<TrendReport>> {
        self.run_chain(Capability::Trend, &self.trend, |p| {
            let request = request.clone();
            async move { p.check_trend(&request).await }
        })
        .await
    }

    pub async fn generate_script(
        &self,
        request: &ScriptRequest,
    ) -> Result<ProviderOutput<Script>> {
        self.run_chain(Capability::Script, &self.script, |p| {
            let request = request.clone();
            async move { p.generate(&request).await }
        })
        .await
    }

    pub async fn improve_script(
        &self,
        request: &ImproveRequest,
    ) -> Result<ProviderOutput<Script>> {
        self.run_chain(Capability::Script, &self.script, |p| {
            let request = request.clone();
            async move { p.improve(&request).await }
        })
        .await
    }

    pub async fn gather_assets(
        &self,
        request: &AssetRequest,
    ) -> Result<ProviderOutput<Vec<AssetRef>>> {
        self.run_chain(Capability::Asset, &self.asset, |p| {
            let request = request.clone();
            async move { p.gather(&request).await }
        })
        .await
    }

    pub async fn synthesize_voiceover(
        &self,
        request: &VoiceoverRequest,
    ) -> Result<ProviderOutput<VoiceoverArtifact>> {
        self.run_chain(Capability::Voiceover, &self.voiceover, |p| {
            let request = request.clone();
            async move { p.synthesize(&request).await }
        })
        .await
    }

    pub async fn assemble_video(
        &self,
        request: &VideoRequest,
    ) -> Result<ProviderOutput<VideoArtifact>> {
        self.run_chain(Capability::Video, &self.video, |p| {
            let request = request.clone();
            async move { p.assemble(&request).await }
        })
        .await
    }

    pub async fn render_thumbnail(
        &self,
        request: &ThumbnailRequest,
    ) -> Result<ProviderOutput<ThumbnailArtifact>> {
        self.run_chain(Capability::Video, &self.video, |p| {
            let request = request.clone();
            async move { p.render_thumbnail(&request).await }
        })
        .await
    }

    async fn run_chain<P, T, F, Fut>(
        &self,
        capability: Capability,
        candidates: &[Arc<P>],
        call: F,
    ) -> Result<ProviderOutput<T>>
    where
        P: Provider + ?Sized,
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if candidates.is_empty() {
            return Err(Error::provider_unavailable(
                capability.as_str(),
                "no providers registered",
            ));
        }

        let mut last_error: Option<Error> = None;
        let mut open_skips = 0usize;

        for candidate in candidates {
            let key = ProviderKey::new(capability, candidate.name());

            let admission = self.breakers.try_acquire(&key);
            if !admission.is_allowed() {
                debug!("Skipping provider {} (circuit open)", key);
                open_skips += 1;
                continue;
            }
            if admission == Admission::Probe {
                debug!("Probing provider {} in half-open state", key);
            }

            match call(candidate.clone()).await {
                Ok(value) => {
                    self.breakers.record_success(&key);
                    return Ok(ProviderOutput {
                        provider: candidate.name().to_string(),
                        value,
                    });
                }
                Err(err) if err.is_retryable() => {
                    self.breakers.record_failure(&key);
                    warn!(
                        "Provider {} failed ({}), advancing to next candidate",
                        key, err
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    self.breakers.record_failure(&key);
                    error!("Provider {} failed fatally: {}", key, err);
                    return Err(err);
                }
            }
        }

        let reason = match last_error {
            Some(err) => format!("all candidates failed, last error: {err}"),
            None => format!("all {open_skips} candidates have open circuits"),
        };
        Err(Error::provider_unavailable(capability.as_str(), reason))
    }
}

fn unknown_backend(capability: Capability, name: &str) -> Error {
    Error::config(format!("unknown {capability} provider '{name}'"))
}

/// The configured chain, with "simple" appended when fallback is enabled and
/// the chain does not already contain it.
fn with_fallback(chain: &[String], use_simple_fallback: bool) -> Vec<String> {
    let mut names: Vec<String> = chain.to_vec();
    if use_simple_fallback && !names.iter().any(|n| n == "simple") {
        names.push("simple".to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::CircuitBreakerConfig;

    /// Script backend with a scripted failure pattern.
    struct ScriptedBackend {
        name: &'static str,
        calls: AtomicU32,
        failures_before_success: u32,
        fatal: bool,
    }

    impl ScriptedBackend {
        fn reliable(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                fatal: false,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                failures_before_success: u32::MAX,
                fatal: false,
            }
        }

        fn fatal(name: &'static str) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                fatal: true,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Provider for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }
    }

    #[async_trait]
    impl ScriptProvider for ScriptedBackend {
        async fn generate(&self, request: &ScriptRequest) -> Result<Script> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(Error::provider_fatal(self.name, "malformed response"));
            }
            if n < self.failures_before_success {
                return Err(Error::provider_unavailable("script", "backend overloaded"));
            }
            Ok(Script {
                title: request.topic.clone(),
                hook: "A hook.".to_string(),
                body: "A body.".to_string(),
                call_to_action: "Follow.".to_string(),
                hashtags: vec![],
            })
        }

        async fn improve(&self, request: &ImproveRequest) -> Result<Script> {
            Ok(request.script.clone())
        }
    }

    fn breakers(threshold: u32) -> Arc<CircuitBreakerManager> {
        Arc::new(CircuitBreakerManager::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_seconds: 60,
            max_cooldown_seconds: 900,
        }))
    }

    fn request() -> ScriptRequest {
        ScriptRequest {
            topic: "rust lifetimes".to_string(),
            niche: "technology".to_string(),
            tier: crate::database::models::QualityTier::Standard,
            target_duration_secs: 45,
        }
    }

    #[tokio::test]
    async fn test_fallback_to_secondary() {
        let primary = Arc::new(ScriptedBackend::failing("primary"));
        let secondary = Arc::new(ScriptedBackend::reliable("secondary"));

        let mut registry = ProviderRegistry::new(breakers(5));
        registry.register_script(primary.clone());
        registry.register_script(secondary.clone());

        let output = registry.generate_script(&request()).await.unwrap();
        assert_eq!(output.provider, "secondary");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped_without_attempt() {
        let primary = Arc::new(ScriptedBackend::failing("primary"));
        let secondary = Arc::new(ScriptedBackend::reliable("secondary"));

        // Threshold 1: the first failure opens the primary's circuit.
        let mut registry = ProviderRegistry::new(breakers(1));
        registry.register_script(primary.clone());
        registry.register_script(secondary.clone());

        registry.generate_script(&request()).await.unwrap();
        assert_eq!(primary.calls(), 1);

        let output = registry.generate_script(&request()).await.unwrap();
        assert_eq!(output.provider, "secondary");
        // Open circuit: primary was not attempted again.
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts_chain() {
        let primary = Arc::new(ScriptedBackend::fatal("primary"));
        let secondary = Arc::new(ScriptedBackend::reliable("secondary"));

        let mut registry = ProviderRegistry::new(breakers(5));
        registry.register_script(primary.clone());
        registry.register_script(secondary.clone());

        let result = registry.generate_script(&request()).await;
        assert!(matches!(result, Err(Error::ProviderFatal { .. })));
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_unavailable() {
        let only = Arc::new(ScriptedBackend::failing("only"));

        let mut registry = ProviderRegistry::new(breakers(5));
        registry.register_script(only.clone());

        let result = registry.generate_script(&request()).await;
        match result {
            Err(Error::ProviderUnavailable { capability, .. }) => {
                assert_eq!(capability, "script");
            }
            other => panic!("expected ProviderUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain_is_unavailable() {
        let registry = ProviderRegistry::new(breakers(5));
        let result = registry.generate_script(&request()).await;
        assert!(matches!(result, Err(Error::ProviderUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_from_config_builds_simple_chains() {
        let config = AppConfig::default();
        let registry =
            ProviderRegistry::from_config(&config, breakers(5)).expect("default config resolves");

        let output = registry.generate_script(&request()).await.unwrap();
        assert_eq!(output.provider, "simple");

        let trend = registry
            .check_trend(&TrendRequest {
                topic: "rust lifetimes".to_string(),
                niche: "technology".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(trend.provider, "simple");
    }

    #[test]
    fn test_with_fallback_appends_once() {
        let chain = vec!["primary".to_string()];
        assert_eq!(with_fallback(&chain, true), vec!["primary", "simple"]);

        let chain = vec!["simple".to_string()];
        assert_eq!(with_fallback(&chain, true), vec!["simple"]);

        let chain = vec!["primary".to_string()];
        assert_eq!(with_fallback(&chain, false), vec!["primary"]);
    }
}
