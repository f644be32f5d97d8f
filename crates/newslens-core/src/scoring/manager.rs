//! Top-level scoring orchestration.
//!
//! The manager binds an article, the ensemble engine, the calculator, the
//! single-flight cache, the persistence gateway, and the progress registry.
//! All dependencies are injected at construction; tests compose their own.
//!
//! The `score` path: fetch article → fingerprint → cache owner election →
//! (owner only) status `scoring`, engine fan-out, calculator, one commit
//! transaction, cache settle, terminal progress. Coalesced callers consume
//! the settled outcome and never touch persistence.

use super::cache::{await_settled, fingerprint, CacheOutcome, Entry, ScoreCache};
use super::calculator;
use super::engine::{EngineOutcome, EnsembleEngine};
use super::progress::{ProgressPatch, ProgressRegistry, ProgressState, ProgressStatus};
use super::{CompositeScore, ScoreSource};
use crate::config::ensemble::{EnsembleConfig, EnsembleHandle};
use crate::error::{CalculatorError, ModelFailure, ScoreError};
use crate::llm::CompletionClient;
use crate::storage::{articles, scores, DbPool};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Bounded rescore queue; a full queue surfaces as 429 to the caller.
pub const RESCORE_QUEUE_CAPACITY: usize = 64;

/// Orchestrator for article scoring runs.
pub struct ScoreManager {
    db: DbPool,
    engine: EnsembleEngine,
    cache: Arc<ScoreCache>,
    progress: Arc<ProgressRegistry>,
    ensemble: Arc<EnsembleHandle>,
    rescore_tx: Option<mpsc::Sender<i64>>,
    cancel: CancellationToken,
}

impl ScoreManager {
    /// Wire up a manager from its collaborators.
    ///
    /// `cancel` is the service-wide shutdown token; every run derives its
    /// deadline token from it so shutdown drains cleanly.
    pub fn new(
        db: DbPool,
        client: Arc<dyn CompletionClient>,
        ensemble: Arc<EnsembleHandle>,
        cache: Arc<ScoreCache>,
        progress: Arc<ProgressRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            engine: EnsembleEngine::new(client, progress.clone()),
            cache,
            progress,
            ensemble,
            rescore_tx: None,
            cancel,
        }
    }

    /// Attach the background rescore queue, returning the receiver to hand
    /// to [`run_rescore_worker`]. Without this, `rescore` reports
    /// `ScoringDisabled`.
    pub fn with_rescore_queue(mut self) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(RESCORE_QUEUE_CAPACITY);
        self.rescore_tx = Some(tx);
        (self, rx)
    }

    /// The active ensemble config handle (shared with the reload watcher).
    pub fn ensemble(&self) -> Arc<EnsembleHandle> {
        self.ensemble.clone()
    }

    /// Score an article synchronously, serving from cache when possible.
    pub async fn score(&self, article_id: i64) -> Result<CompositeScore, ScoreError> {
        let article = articles::fetch_article(&self.db, article_id)
            .await?
            .ok_or(ScoreError::NotFound { article_id })?;

        let config = self.ensemble.current();
        let fp = fingerprint(&article.content, &config.version, &config.prompt_variant.id);

        match self.cache.get_or_start(&fp) {
            Entry::Waiter(rx) => match await_settled(rx).await {
                CacheOutcome::Ready(composite) => {
                    // A terminal event so subscribers attached to a cache
                    // hit still see their stream finish; dropped as a
                    // duplicate when the owner already published one.
                    self.progress.update(
                        article_id,
                        ProgressPatch {
                            status: Some(ProgressStatus::Complete),
                            step: Some("complete".to_string()),
                            percent: Some(100),
                            message: Some("served from cache".to_string()),
                            final_score: Some(composite.score),
                            ..Default::default()
                        },
                    );
                    Ok(CompositeScore {
                        article_id,
                        ..composite
                    })
                }
                CacheOutcome::Failed { code, message } => {
                    self.progress.update(
                        article_id,
                        ProgressPatch {
                            status: Some(ProgressStatus::Error),
                            step: Some("error".to_string()),
                            message: Some("scoring run failed".to_string()),
                            error: Some(message.clone()),
                            ..Default::default()
                        },
                    );
                    Err(ScoreError::Cached { code, message })
                }
            },
            Entry::Owner => {
                let result = self.owned_run(&article, &config).await;
                match &result {
                    Ok(composite) => {
                        self.cache.settle(&fp, CacheOutcome::Ready(composite.clone()));
                    }
                    Err(e) => {
                        self.cache.settle(
                            &fp,
                            CacheOutcome::Failed {
                                code: e.code().to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
                result
            }
        }
    }

    /// Enqueue an asynchronous rescore; the returned token doubles as the
    /// progress-subscription key.
    pub async fn rescore(&self, article_id: i64) -> Result<i64, ScoreError> {
        articles::fetch_article(&self.db, article_id)
            .await?
            .ok_or(ScoreError::NotFound { article_id })?;

        let tx = self.rescore_tx.as_ref().ok_or(ScoreError::ScoringDisabled)?;
        match tx.try_send(article_id) {
            Ok(()) => {
                self.progress.begin(article_id);
                Ok(article_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ScoreError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ScoreError::ScoringDisabled),
        }
    }

    /// Read the persisted composite without computing anything.
    pub async fn get_composite(
        &self,
        article_id: i64,
    ) -> Result<Option<CompositeScore>, ScoreError> {
        let article = articles::fetch_article(&self.db, article_id)
            .await?
            .ok_or(ScoreError::NotFound { article_id })?;

        let (Some(score), Some(confidence)) = (article.composite_score, article.confidence)
        else {
            return Ok(None);
        };
        Ok(Some(CompositeScore {
            article_id,
            score,
            confidence,
            source: article
                .score_source
                .as_deref()
                .and_then(ScoreSource::parse)
                .unwrap_or(ScoreSource::Ensemble),
            scored_at: article.scored_at.unwrap_or_default(),
        }))
    }

    /// Persist an operator-supplied composite without dispatching models.
    pub async fn set_manual_score(
        &self,
        article_id: i64,
        score: f64,
    ) -> Result<CompositeScore, ScoreError> {
        if !(-1.0..=1.0).contains(&score) {
            return Err(ScoreError::Invalid {
                message: format!("score {score} outside [-1, 1]"),
            });
        }
        articles::fetch_article(&self.db, article_id)
            .await?
            .ok_or(ScoreError::NotFound { article_id })?;

        let composite = CompositeScore {
            article_id,
            score,
            confidence: 1.0,
            source: ScoreSource::Manual,
            scored_at: now(),
        };
        articles::update_composite(&self.db, &composite).await?;
        Ok(composite)
    }

    /// Subscribe to an article's live progress.
    pub fn subscribe_progress(
        &self,
        article_id: i64,
    ) -> (ProgressState, broadcast::Receiver<ProgressState>) {
        self.progress.subscribe(article_id)
    }

    /// The owner path: the one caller per fingerprint that actually runs
    /// the ensemble and writes persistence.
    async fn owned_run(
        &self,
        article: &articles::Article,
        config: &Arc<EnsembleConfig>,
    ) -> Result<CompositeScore, ScoreError> {
        self.progress.begin(article.id);
        self.progress.update(
            article.id,
            ProgressPatch {
                status: Some(ProgressStatus::Queued),
                step: Some("queued".to_string()),
                message: Some("scoring run queued".to_string()),
                ..Default::default()
            },
        );

        // Deadline watchdog; the run token is a child of the service token
        // so shutdown also cancels in-flight runs.
        let run_cancel = self.cancel.child_token();
        let deadline = Duration::from_secs(config.run_deadline_seconds);
        let watchdog_token = run_cancel.clone();
        let watchdog = tokio::spawn(async move {
            tokio::select! {
                () = watchdog_token.cancelled() => {}
                () = tokio::time::sleep(deadline) => watchdog_token.cancel(),
            }
        });

        let result = self.execute_run(article, config, &run_cancel).await;

        run_cancel.cancel();
        let _ = watchdog.await;

        // The engine cannot tell what fired its token; attribute the cause
        // here. If the service token is clean, the deadline did it.
        let result = result.map_err(|e| match e {
            ScoreError::Cancelled { .. } => ScoreError::Cancelled {
                by_deadline: !self.cancel.is_cancelled(),
            },
            other => other,
        });

        match result {
            Ok(composite) => {
                self.progress.update(
                    article.id,
                    ProgressPatch {
                        status: Some(ProgressStatus::Complete),
                        step: Some("complete".to_string()),
                        percent: Some(100),
                        message: Some("scoring complete".to_string()),
                        final_score: Some(composite.score),
                        ..Default::default()
                    },
                );
                Ok(composite)
            }
            Err(e) => {
                if let Err(status_err) =
                    articles::set_status(&self.db, article.id, articles::ArticleStatus::Failed)
                        .await
                {
                    tracing::error!(
                        article_id = article.id,
                        error = %status_err,
                        "failed to mark article as failed"
                    );
                }
                self.progress.update(
                    article.id,
                    ProgressPatch {
                        status: Some(ProgressStatus::Error),
                        step: Some("error".to_string()),
                        message: Some("scoring run failed".to_string()),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                Err(e)
            }
        }
    }

    /// Engine fan-out, calculation, and the single commit transaction.
    async fn execute_run(
        &self,
        article: &articles::Article,
        config: &Arc<EnsembleConfig>,
        run_cancel: &CancellationToken,
    ) -> Result<CompositeScore, ScoreError> {
        articles::set_status(&self.db, article.id, articles::ArticleStatus::Scoring).await?;

        let EngineOutcome { results, failures } =
            self.engine.run(article, config, run_cancel).await?;

        let (score, confidence) = match calculator::compute(&results, config) {
            Ok(pair) => pair,
            Err(CalculatorError::NoValidResults) => {
                return Err(classify_total_failure(failures));
            }
            Err(CalculatorError::InvalidResult { model, score }) => {
                let mut failures = failures;
                failures.push(ModelFailure {
                    model,
                    kind: "invalid_result".to_string(),
                    message: format!("score {score} outside [-1, 1]"),
                    retry_after_secs: None,
                });
                return Err(ScoreError::ProviderUnavailable { failures });
            }
        };

        let composite = CompositeScore {
            article_id: article.id,
            score,
            confidence,
            source: if results.is_empty() {
                ScoreSource::Default
            } else {
                ScoreSource::Ensemble
            },
            scored_at: now(),
        };

        scores::commit_run(&self.db, &results, &composite).await?;

        tracing::info!(
            article_id = article.id,
            score = composite.score,
            confidence = composite.confidence,
            models = results.len(),
            failed = failures.len(),
            "article scored"
        );
        Ok(composite)
    }
}

/// Zero valid results: all-rate-limited runs surface as 429 with the
/// largest hint, everything else as the structured 503.
fn classify_total_failure(failures: Vec<ModelFailure>) -> ScoreError {
    if !failures.is_empty() && failures.iter().all(|f| f.kind == "rate_limited") {
        let retry_after_secs = failures.iter().filter_map(|f| f.retry_after_secs).max();
        return ScoreError::RateLimited { retry_after_secs };
    }
    ScoreError::ProviderUnavailable { failures }
}

/// Background worker draining the rescore queue.
///
/// Runs sequentially: each queued article is scored (or served from cache)
/// before the next is picked up. Runs until `cancel` fires.
pub async fn run_rescore_worker(
    manager: Arc<ScoreManager>,
    mut rx: mpsc::Receiver<i64>,
    cancel: CancellationToken,
) {
    loop {
        let article_id = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("rescore worker cancelled");
                return;
            }
            id = rx.recv() => match id {
                Some(id) => id,
                None => return,
            },
        };

        match manager.score(article_id).await {
            Ok(composite) => {
                tracing::info!(article_id, score = composite.score, "rescore finished");
            }
            Err(e) => {
                tracing::warn!(article_id, error = %e, "rescore failed");
            }
        }
    }
}

fn now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ensemble::{
        InvalidPolicy, KeySelector, ModelSpec, Perspective, PromptVariant,
    };
    use crate::error::ProviderError;
    use crate::storage::articles::{insert_article, NewArticle};
    use crate::storage::{init_test_db, scores::fetch_scores};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed per-model behaviour, shared across all calls.
    enum Behaviour {
        Reply(&'static str),
        Fail(fn() -> ProviderError),
        SlowReply(&'static str, Duration),
    }

    struct FixedClient {
        behaviours: HashMap<String, Behaviour>,
        calls: AtomicUsize,
    }

    impl FixedClient {
        fn new(behaviours: Vec<(&str, Behaviour)>) -> Arc<Self> {
            Arc::new(Self {
                behaviours: behaviours
                    .into_iter()
                    .map(|(m, b)| (m.to_string(), b))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for FixedClient {
        async fn complete(
            &self,
            model: &ModelSpec,
            _prompt: &str,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.behaviours.get(&model.name) {
                Some(Behaviour::Reply(body)) => Ok((*body).to_string()),
                Some(Behaviour::Fail(make)) => Err(make()),
                Some(Behaviour::SlowReply(body, delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok((*body).to_string())
                }
                None => Err(ProviderError::Transient {
                    message: "unknown model".to_string(),
                }),
            }
        }
    }

    fn model(name: &str, perspective: Perspective) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            url: "https://api.example.com/v1".to_string(),
            perspective,
            weight: 1.0,
            key_selector: KeySelector::Primary,
        }
    }

    fn three_model_config() -> EnsembleConfig {
        EnsembleConfig {
            models: vec![
                model("a", Perspective::Left),
                model("b", Perspective::Center),
                model("c", Perspective::Right),
            ],
            prompt_variant: PromptVariant {
                id: "v1".to_string(),
                template: "Rate {title}: {content}".to_string(),
                examples: vec![],
            },
            version: "test-version".to_string(),
            ..EnsembleConfig::default()
        }
    }

    async fn seeded_article(db: &DbPool) -> i64 {
        insert_article(
            db,
            &NewArticle {
                title: "Headline".to_string(),
                content: "Body text".to_string(),
                source: "feed".to_string(),
                pub_date: "2026-03-01T00:00:00Z".to_string(),
            },
        )
        .await
        .expect("insert article")
    }

    fn manager_with(
        db: DbPool,
        client: Arc<dyn CompletionClient>,
        config: EnsembleConfig,
    ) -> ScoreManager {
        ScoreManager::new(
            db,
            client,
            Arc::new(EnsembleHandle::new(config)),
            Arc::new(ScoreCache::new(
                Duration::from_secs(900),
                Duration::from_secs(30),
            )),
            Arc::new(ProgressRegistry::new(Duration::from_secs(300))),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn happy_path_three_models() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Reply(r#"{"score": -0.8, "confidence": 0.9}"#)),
            ("b", Behaviour::Reply(r#"{"score": -0.6, "confidence": 0.8}"#)),
            ("c", Behaviour::Reply(r#"{"score": -0.8, "confidence": 0.9}"#)),
        ]);
        let manager = manager_with(db.clone(), client.clone(), three_model_config());

        let composite = manager.score(id).await.expect("score");
        assert!((composite.score - (-2.2 / 3.0)).abs() < 1e-9);
        assert!((composite.confidence - (2.6 / 3.0)).abs() < 1e-9);
        assert_eq!(composite.source, ScoreSource::Ensemble);

        let rows = fetch_scores(&db, id).await.expect("rows");
        assert_eq!(rows.len(), 3);

        let state = manager.progress.get(id).expect("progress");
        assert_eq!(state.status, ProgressStatus::Complete);
        assert_eq!(state.percent, 100);
        assert!((state.final_score.unwrap() - (-2.2 / 3.0)).abs() < 1e-9);

        let article = articles::fetch_article(&db, id).await.expect("fetch").expect("row");
        assert_eq!(article.status, "scored");
    }

    #[tokio::test]
    async fn unknown_article_is_not_found() {
        let db = init_test_db().await.expect("init db");
        let client = FixedClient::new(vec![]);
        let manager = manager_with(db, client, three_model_config());

        let err = manager.score(999).await.unwrap_err();
        assert!(matches!(err, ScoreError::NotFound { article_id: 999 }));
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_dispatch() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let body = r#"{"score": -0.5, "confidence": 0.9}"#;
        let client = FixedClient::new(vec![
            ("a", Behaviour::SlowReply(body, Duration::from_millis(100))),
            ("b", Behaviour::SlowReply(body, Duration::from_millis(100))),
            ("c", Behaviour::SlowReply(body, Duration::from_millis(100))),
        ]);
        let manager =
            Arc::new(manager_with(db.clone(), client.clone(), three_model_config()));

        let (first, second) = tokio::join!(
            {
                let m = manager.clone();
                async move { m.score(id).await }
            },
            {
                let m = manager.clone();
                async move { m.score(id).await }
            }
        );

        let first = first.expect("first caller");
        let second = second.expect("second caller");
        assert_eq!(first.score, second.score);
        assert_eq!(client.calls(), 3, "each model called exactly once");
        assert_eq!(fetch_scores(&db, id).await.expect("rows").len(), 3);
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Reply(r#"{"score": 0.1, "confidence": 0.5}"#)),
            ("b", Behaviour::Reply(r#"{"score": 0.1, "confidence": 0.5}"#)),
            ("c", Behaviour::Reply(r#"{"score": 0.1, "confidence": 0.5}"#)),
        ]);
        let manager = manager_with(db.clone(), client.clone(), three_model_config());

        manager.score(id).await.expect("first run");
        let calls_after_first = client.calls();
        manager.score(id).await.expect("second run");

        assert_eq!(client.calls(), calls_after_first, "cache hit must not dispatch");
        let rows = fetch_scores(&db, id).await.expect("rows");
        assert!(rows.iter().all(|r| r.version == 1), "no row rewritten");
    }

    #[tokio::test]
    async fn cache_hit_still_terminates_progress() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Reply(r#"{"score": 0.2, "confidence": 0.5}"#)),
            ("b", Behaviour::Reply(r#"{"score": 0.2, "confidence": 0.5}"#)),
            ("c", Behaviour::Reply(r#"{"score": 0.2, "confidence": 0.5}"#)),
        ]);
        let manager = manager_with(db, client, three_model_config());

        manager.score(id).await.expect("first run");

        // A later subscriber sees a fresh Queued entry; the cache hit must
        // still close it out.
        manager.progress.begin(id);
        manager.score(id).await.expect("cache hit");
        let state = manager.progress.get(id).expect("progress");
        assert_eq!(state.status, ProgressStatus::Complete);
        assert_eq!(state.message, "served from cache");
    }

    #[tokio::test]
    async fn all_providers_dead_fails_run_and_caches_negatively() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
            ("b", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
            ("c", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
        ]);
        let manager = manager_with(db.clone(), client.clone(), three_model_config());

        let err = manager.score(id).await.unwrap_err();
        match &err {
            ScoreError::ProviderUnavailable { failures } => {
                assert_eq!(failures.len(), 3);
                assert!(failures.iter().all(|f| f.kind == "credits_exhausted"));
            }
            other => panic!("expected ProviderUnavailable, got: {other}"),
        }

        let article = articles::fetch_article(&db, id).await.expect("fetch").expect("row");
        assert_eq!(article.status, "failed");
        let state = manager.progress.get(id).expect("progress");
        assert_eq!(state.status, ProgressStatus::Error);
        assert!(state.error.is_some());

        // The negative cache replays the failure without re-dispatching.
        let calls = client.calls();
        let err = manager.score(id).await.unwrap_err();
        assert!(matches!(err, ScoreError::Cached { ref code, .. } if code == "provider_unavailable"));
        assert_eq!(client.calls(), calls);
    }

    #[tokio::test]
    async fn all_rate_limited_surfaces_retry_hint() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Fail(|| ProviderError::RateLimited { retry_after_secs: Some(7) })),
            ("b", Behaviour::Fail(|| ProviderError::RateLimited { retry_after_secs: Some(30) })),
            ("c", Behaviour::Fail(|| ProviderError::RateLimited { retry_after_secs: None })),
        ]);
        let manager = manager_with(db, client, three_model_config());

        let err = manager.score(id).await.unwrap_err();
        assert!(matches!(
            err,
            ScoreError::RateLimited { retry_after_secs: Some(30) }
        ));
    }

    #[tokio::test]
    async fn default_zero_persists_zero_composite_when_all_fail() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
            ("b", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
            ("c", Behaviour::Fail(|| ProviderError::CreditsExhausted)),
        ]);
        let mut config = three_model_config();
        config.handle_invalid = InvalidPolicy::DefaultZero;
        let manager = manager_with(db.clone(), client, config);

        let composite = manager.score(id).await.expect("score");
        assert_eq!((composite.score, composite.confidence), (0.0, 0.0));
        assert_eq!(composite.source, ScoreSource::Default);

        let article = articles::fetch_article(&db, id).await.expect("fetch").expect("row");
        assert_eq!(article.status, "scored");
        assert_eq!(article.composite_score, Some(0.0));
    }

    #[tokio::test]
    async fn deadline_cancels_run_without_partial_writes() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let body = r#"{"score": 0.0, "confidence": 0.5}"#;
        let client = FixedClient::new(vec![
            ("a", Behaviour::SlowReply(body, Duration::from_secs(5))),
            ("b", Behaviour::SlowReply(body, Duration::from_secs(5))),
            ("c", Behaviour::SlowReply(body, Duration::from_secs(5))),
        ]);
        let mut config = three_model_config();
        config.run_deadline_seconds = 1;
        let manager = manager_with(db.clone(), client, config);

        let started = tokio::time::Instant::now();
        let err = manager.score(id).await.unwrap_err();
        assert!(matches!(err, ScoreError::Cancelled { by_deadline: true }));
        assert!(started.elapsed() < Duration::from_secs(3));

        let article = articles::fetch_article(&db, id).await.expect("fetch").expect("row");
        assert_eq!(article.status, "failed");
        assert!(article.composite_score.is_none(), "no partial composite");
        assert!(fetch_scores(&db, id).await.expect("rows").is_empty());
    }

    #[tokio::test]
    async fn get_composite_reads_through_persistence_only() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Reply(r#"{"score": 0.3, "confidence": 0.6}"#)),
            ("b", Behaviour::Reply(r#"{"score": 0.3, "confidence": 0.6}"#)),
            ("c", Behaviour::Reply(r#"{"score": 0.3, "confidence": 0.6}"#)),
        ]);
        let manager = manager_with(db, client.clone(), three_model_config());

        assert!(manager.get_composite(id).await.expect("read").is_none());
        assert_eq!(client.calls(), 0, "read path must not compute");

        manager.score(id).await.expect("score");
        let composite = manager.get_composite(id).await.expect("read").expect("some");
        assert!((composite.score - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn manual_score_validates_and_persists() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let manager = manager_with(db.clone(), FixedClient::new(vec![]), three_model_config());

        let err = manager.set_manual_score(id, 1.5).await.unwrap_err();
        assert!(matches!(err, ScoreError::Invalid { .. }));

        let composite = manager.set_manual_score(id, -0.25).await.expect("manual");
        assert_eq!(composite.source, ScoreSource::Manual);

        let read = manager.get_composite(id).await.expect("read").expect("some");
        assert_eq!(read.source, ScoreSource::Manual);
        assert!((read.score + 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rescore_without_worker_is_disabled() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let manager = manager_with(db, FixedClient::new(vec![]), three_model_config());

        let err = manager.rescore(id).await.unwrap_err();
        assert!(matches!(err, ScoreError::ScoringDisabled));
    }

    #[tokio::test]
    async fn rescore_worker_drains_queue_to_completion() {
        let db = init_test_db().await.expect("init db");
        let id = seeded_article(&db).await;
        let client = FixedClient::new(vec![
            ("a", Behaviour::Reply(r#"{"score": -0.2, "confidence": 0.9}"#)),
            ("b", Behaviour::Reply(r#"{"score": -0.2, "confidence": 0.9}"#)),
            ("c", Behaviour::Reply(r#"{"score": -0.2, "confidence": 0.9}"#)),
        ]);
        let (manager, rx) =
            manager_with(db.clone(), client, three_model_config()).with_rescore_queue();
        let manager = Arc::new(manager);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_rescore_worker(manager.clone(), rx, cancel.clone()));

        let token = manager.rescore(id).await.expect("enqueue");
        assert_eq!(token, id);

        let (snapshot, mut progress_rx) = manager.subscribe_progress(id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut state = snapshot;
        while state.status != ProgressStatus::Complete {
            let remaining = deadline - tokio::time::Instant::now();
            state = tokio::time::timeout(remaining, progress_rx.recv())
                .await
                .expect("progress before deadline")
                .expect("channel open");
        }
        assert!((state.final_score.unwrap() + 0.2).abs() < 1e-9);

        cancel.cancel();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn rescore_unknown_article_is_not_found() {
        let db = init_test_db().await.expect("init db");
        let (manager, _rx) = manager_with(db, FixedClient::new(vec![]), three_model_config()).with_rescore_queue();

        let err = manager.rescore(12345).await.unwrap_err();
        assert!(matches!(err, ScoreError::NotFound { .. }));
    }
}
