//! Integration tests for the shortforge pipeline.
//!
//! `database_tests` verifies the schema against a real SQLite database.
//! `pipeline_flow_tests` runs the full production loop: manager, worker
//! pool, deterministic provider backends and a file-backed database (pooled
//! in-memory connections do not share schema, so workers need a real file).

use shortforge::database::{DbPool, init_pool, run_migrations};

/// Helper to create a test database pool with migrations applied.
async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let pool = setup_test_db().await;

        // Verify tables exist by querying sqlite_master
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("Failed to query tables");

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(table_names.contains(&"jobs"), "jobs table missing");
        assert!(table_names.contains(&"job_logs"), "job_logs table missing");
        assert!(table_names.contains(&"channels"), "channels table missing");
        assert!(table_names.contains(&"videos"), "videos table missing");
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let pool = setup_test_db().await;

        // In-memory databases use "memory" journal mode; file-based would
        // use "wal".
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .expect("Failed to query journal mode");

        assert!(result.0 == "memory" || result.0 == "wal");
    }

    #[tokio::test]
    async fn test_job_indexes_exist() {
        let pool = setup_test_db().await;

        let indexes: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='index' AND sql IS NOT NULL")
                .fetch_all(&pool)
                .await
                .expect("Failed to query indexes");

        let names: Vec<&str> = indexes.iter().map(|i| i.0.as_str()).collect();
        assert!(
            names.iter().any(|n| n.contains("jobs")),
            "expected at least one index on jobs, got {names:?}"
        );
    }
}

mod pipeline_flow_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    use shortforge::config::{AppConfig, PipelineConfig, QualityConfig};
    use shortforge::database::models::{ChannelDbModel, JobDbModel, JobPriority, JobStage, JobStatus};
    use shortforge::database::repositories::{
        ChannelRepository, SqlxChannelRepository, SqlxJobRepository, SqlxVideoRepository,
        VideoRepository,
    };
    use shortforge::database::{self, DbPool};
    use shortforge::pipeline::PipelineManager;
    use shortforge::providers::simple::{
        SimpleAssetProvider, SimpleScriptProvider, SimpleTrendProvider, SimpleVideoProvider,
        SimpleVoiceoverProvider,
    };
    use shortforge::providers::{
        ImproveRequest, Provider, ProviderRegistry, Script, ScriptProvider, ScriptRequest,
    };
    use shortforge::resilience::{CircuitBreakerManager, CircuitState};
    use shortforge::upload::LocalArchiveUploader;
    use shortforge::{Error, Result};

    struct PipelineHarness {
        manager: Arc<PipelineManager>,
        channel_repo: Arc<SqlxChannelRepository>,
        video_repo: Arc<SqlxVideoRepository>,
        config: AppConfig,
        pool: DbPool,
        _dir: TempDir,
    }

    /// Full production wiring over a file-backed temp database, with a
    /// permissive gate and fast retries unless the test overrides them.
    async fn pipeline_harness(
        configure: impl FnOnce(&mut AppConfig),
        register: impl FnOnce(&AppConfig, &mut ProviderRegistry),
    ) -> PipelineHarness {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let db_url = format!(
            "sqlite:{}?mode=rwc",
            db_path.to_string_lossy().replace('\\', "/")
        );
        let pool = database::init_pool(&db_url).await.unwrap();
        database::run_migrations(&pool).await.unwrap();

        let mut config = AppConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            quality: QualityConfig {
                min_quality_score: 30.0,
                improve_floor: 10.0,
                ..QualityConfig::default()
            },
            pipeline: PipelineConfig {
                retry_initial_delay_ms: 1,
                retry_max_delay_ms: 5,
                ..PipelineConfig::default()
            },
            ..AppConfig::default()
        };
        configure(&mut config);

        let channel_repo = Arc::new(SqlxChannelRepository::new(pool.clone()));
        channel_repo
            .create_channel(&ChannelDbModel::new("tech", "TechBytes", "technology"))
            .await
            .unwrap();

        let manager = build_manager(&config, &pool, register);
        let video_repo = Arc::new(SqlxVideoRepository::new(pool.clone()));

        PipelineHarness {
            manager,
            channel_repo,
            video_repo,
            config,
            pool,
            _dir: dir,
        }
    }

    /// A second manager over the same database stands in for a process
    /// restart.
    fn build_manager(
        config: &AppConfig,
        pool: &DbPool,
        register: impl FnOnce(&AppConfig, &mut ProviderRegistry),
    ) -> Arc<PipelineManager> {
        let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
        let mut registry = ProviderRegistry::new(breakers);
        register(config, &mut registry);

        Arc::new(PipelineManager::new(
            config.clone(),
            Arc::new(registry),
            Arc::new(LocalArchiveUploader::new(&config.data_dir)),
            Arc::new(SqlxJobRepository::new(pool.clone())),
            Arc::new(SqlxChannelRepository::new(pool.clone())),
            Arc::new(SqlxVideoRepository::new(pool.clone())),
        ))
    }

    /// Deterministic backends for every capability.
    fn register_simple_set(config: &AppConfig, registry: &mut ProviderRegistry) {
        registry.register_trend(Arc::new(SimpleTrendProvider::new()));
        registry.register_script(Arc::new(SimpleScriptProvider::new(
            config.quality.words_per_second,
        )));
        register_simple_tail(config, registry);
    }

    fn register_simple_tail(config: &AppConfig, registry: &mut ProviderRegistry) {
        registry.register_asset(Arc::new(SimpleAssetProvider::new(&config.data_dir)));
        registry.register_voiceover(Arc::new(SimpleVoiceoverProvider::new(
            &config.data_dir,
            config.quality.words_per_second,
        )));
        registry.register_video(Arc::new(SimpleVideoProvider::new(&config.data_dir)));
    }

    /// Poll until the job reaches `want`, panicking if it lands in a
    /// different terminal state first.
    async fn wait_for_status(
        manager: &PipelineManager,
        job_id: &str,
        want: JobStatus,
    ) -> JobDbModel {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let job = manager.get_job(job_id).await.unwrap();
            match job.get_status() {
                Some(reached) if reached == want => return job,
                Some(JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled) => {
                    panic!(
                        "job {job_id} finished as {} while waiting for {}",
                        job.status,
                        want.as_str()
                    );
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for job {job_id} to reach {} (currently {})",
                    want.as_str(),
                    job.status
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_job_runs_to_approval_and_uploads_on_approve() {
        let h = pipeline_harness(|_| {}, register_simple_set).await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("rust iterators", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let parked = wait_for_status(&h.manager, &job_id, JobStatus::AwaitingApproval).await;
        assert_eq!(parked.get_stage(), Some(JobStage::HumanApproval));
        assert!(parked.quality_score.is_some());

        let pending = h.manager.pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, job_id);
        assert!(pending[0].video_path.is_some());

        h.manager.approve_job(&job_id).await.unwrap();
        let done = wait_for_status(&h.manager, &job_id, JobStatus::Succeeded).await;
        assert_eq!(done.get_stage(), Some(JobStage::Done));
        assert!(done.completed_at.is_some());
        assert!(done.get_artifacts().external_video_id.is_some());

        let channel = h.channel_repo.get_channel("tech").await.unwrap();
        assert_eq!(channel.daily_upload_count, 1);
        assert!(channel.last_upload_at.is_some());

        let video = h
            .video_repo
            .get_video_for_job(&job_id)
            .await
            .unwrap()
            .expect("video row for completed job");
        assert!(video.external_video_id.is_some());
        assert!(video.uploaded_at.is_some());

        h.manager.stop().await;
    }

    /// Serves a weak script first, then (optionally) a strong one from
    /// `improve`.
    struct ReworkScriptProvider {
        improved_passes: bool,
    }

    impl Provider for ReworkScriptProvider {
        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[async_trait]
    impl ScriptProvider for ReworkScriptProvider {
        async fn generate(&self, _request: &ScriptRequest) -> Result<Script> {
            // Flat statements that land in the improvement band of a 70/40
            // gate.
            Ok(Script {
                title: "Plain facts".into(),
                hook: "Here are some plain facts for the day.".into(),
                body: "We will go through each fact in turn. Each fact is short. \
                       Each fact is plain. The facts do not change. The list stays the same."
                    .into(),
                call_to_action: "Follow for more facts.".into(),
                hashtags: vec!["#shorts".into()],
            })
        }

        async fn improve(&self, request: &ImproveRequest) -> Result<Script> {
            if !self.improved_passes {
                return Ok(request.script.clone());
            }
            let mut script = request.script.clone();
            script.hook = "What if one fact could change how you work?".into();
            script.body = format!(
                "{} Stop and try the easy fast check: 3 proven steps, no secret tricks.",
                script.body
            );
            script.call_to_action = "Comment your take. Follow for more fast facts.".into();
            Ok(script)
        }
    }

    #[tokio::test]
    async fn test_quality_band_improves_once_end_to_end() {
        let h = pipeline_harness(
            |config| {
                config.quality.min_quality_score = 70.0;
                config.quality.improve_floor = 40.0;
            },
            |config, registry| {
                registry.register_trend(Arc::new(SimpleTrendProvider::new()));
                registry.register_script(Arc::new(ReworkScriptProvider {
                    improved_passes: true,
                }));
                register_simple_tail(config, registry);
            },
        )
        .await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("focus tricks", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let parked = wait_for_status(&h.manager, &job_id, JobStatus::AwaitingApproval).await;
        assert_eq!(parked.improve_count, 1);
        let score = parked.quality_score.unwrap();
        assert!(score >= 70.0, "improved script should pass, got {score}");

        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_quality_rejection_fails_job_end_to_end() {
        let h = pipeline_harness(
            |config| {
                config.quality.min_quality_score = 70.0;
                config.quality.improve_floor = 40.0;
            },
            |config, registry| {
                registry.register_trend(Arc::new(SimpleTrendProvider::new()));
                registry.register_script(Arc::new(ReworkScriptProvider {
                    improved_passes: false,
                }));
                register_simple_tail(config, registry);
            },
        )
        .await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("focus tricks", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let failed = wait_for_status(&h.manager, &job_id, JobStatus::Failed).await;
        assert_eq!(failed.improve_count, 1);
        let history = failed.get_error_history();
        assert_eq!(history.last().unwrap().kind, "QUALITY_REJECTED");

        h.manager.stop().await;
    }

    /// A scripting backend that is always down with a retryable error.
    struct OfflineScriptProvider;

    impl Provider for OfflineScriptProvider {
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[async_trait]
    impl ScriptProvider for OfflineScriptProvider {
        async fn generate(&self, _request: &ScriptRequest) -> Result<Script> {
            Err(Error::provider_unavailable("script", "backend offline"))
        }

        async fn improve(&self, _request: &ImproveRequest) -> Result<Script> {
            Err(Error::provider_unavailable("script", "backend offline"))
        }
    }

    #[tokio::test]
    async fn test_script_fallback_uses_standby_and_opens_breaker() {
        let h = pipeline_harness(
            |config| {
                config.circuit_breaker.failure_threshold = 1;
            },
            |config, registry| {
                registry.register_trend(Arc::new(SimpleTrendProvider::new()));
                // Primary is down; the simple backend is the standby.
                registry.register_script(Arc::new(OfflineScriptProvider));
                registry.register_script(Arc::new(SimpleScriptProvider::new(
                    config.quality.words_per_second,
                )));
                register_simple_tail(config, registry);
            },
        )
        .await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("rust iterators", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let parked = wait_for_status(&h.manager, &job_id, JobStatus::AwaitingApproval).await;
        let script = parked.get_artifacts().script.expect("script artifact");
        assert_eq!(script.provider, "simple");

        let stats = h.manager.stats().await.unwrap();
        let breaker = stats
            .breakers
            .iter()
            .find(|b| b.provider == "script:flaky")
            .expect("breaker for the failed primary");
        assert_eq!(breaker.state, CircuitState::Open);

        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_daily_cap_defers_upload_instead_of_failing() {
        let h = pipeline_harness(|_| {}, register_simple_set).await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("capped channel", "tech", JobPriority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.manager, &job_id, JobStatus::AwaitingApproval).await;

        // Exhaust today's quota before the operator approves.
        let mut channel = h.channel_repo.get_channel("tech").await.unwrap();
        channel.daily_upload_count = h.config.upload.max_daily_uploads as i32;
        channel.upload_count_date = Utc::now().format("%Y-%m-%d").to_string();
        h.channel_repo.update_channel(&channel).await.unwrap();

        h.manager.approve_job(&job_id).await.unwrap();
        let deferred = wait_for_status(&h.manager, &job_id, JobStatus::Deferred).await;
        assert_eq!(deferred.get_stage(), Some(JobStage::Upload));
        assert!(deferred.not_before.is_some());

        // The worker re-admits the row; it waits in the queue, not failed.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.manager.queue_depth() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "deferred job never re-admitted"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(h.manager.queue_depth(), 1);

        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_parked_job_survives_restart() {
        let h = pipeline_harness(|_| {}, register_simple_set).await;
        h.manager.start();

        let job_id = h
            .manager
            .create_job("rust iterators", "tech", JobPriority::Normal)
            .await
            .unwrap();
        wait_for_status(&h.manager, &job_id, JobStatus::AwaitingApproval).await;
        h.manager.stop().await;

        // Same database, fresh manager.
        let manager = build_manager(&h.config, &h.pool, register_simple_set);
        let recovered = manager.recover_jobs().await.unwrap();
        assert_eq!(recovered, 0, "parked approvals stay parked, not requeued");
        manager.start();

        let pending = manager.pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, job_id);

        manager.approve_job(&job_id).await.unwrap();
        let done = wait_for_status(&manager, &job_id, JobStatus::Succeeded).await;
        assert_eq!(done.get_stage(), Some(JobStage::Done));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_queue_full() {
        let h = pipeline_harness(
            |config| {
                config.pipeline.queue_capacity = 2;
            },
            register_simple_set,
        )
        .await;
        // Workers stay off so admitted jobs hold their slots.

        h.manager
            .create_job("first", "tech", JobPriority::Normal)
            .await
            .unwrap();
        h.manager
            .create_job("second", "tech", JobPriority::Normal)
            .await
            .unwrap();

        let err = h
            .manager
            .create_job("third", "tech", JobPriority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CAPACITY_EXCEEDED");
        assert_eq!(h.manager.queue_depth(), 2);
    }
}
