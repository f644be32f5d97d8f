//! Ensemble fan-out controller.
//!
//! Dispatches one task per configured model on a bounded per-run worker
//! pool, feeds raw responses through the parser (with an optional repair
//! call after a parse failure), publishes per-model progress, and collects
//! the valid results. Per-model failures are recovered locally; peers are
//! only halted when `handle_invalid = fail` or the run is cancelled.

use super::parser;
use super::progress::{ProgressPatch, ProgressRegistry, ProgressStatus};
use super::ModelScore;
use crate::config::ensemble::{EnsembleConfig, InvalidPolicy, ModelSpec};
use crate::error::{ModelFailure, ScoreError};
use crate::llm::CompletionClient;
use crate::storage::articles::Article;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Appended to the original prompt for the single repair call.
const REPAIR_INSTRUCTION: &str = "\n\nYour previous reply could not be parsed. Respond with \
ONLY a single JSON object of the form {\"score\": <number in [-1, 1]>, \"confidence\": \
<number in [0, 1]>, \"explanation\": \"<one sentence>\"}. No prose, no code fences.";

/// What one ensemble run produced.
#[derive(Debug)]
pub struct EngineOutcome {
    /// Valid per-model results, in configured model order.
    pub results: Vec<ModelScore>,
    /// Models that produced nothing usable, with classified kinds.
    pub failures: Vec<ModelFailure>,
}

/// Fan-out controller for one article's scoring run.
pub struct EnsembleEngine {
    client: Arc<dyn CompletionClient>,
    progress: Arc<ProgressRegistry>,
}

impl EnsembleEngine {
    /// Create an engine over a provider client and a progress sink.
    pub fn new(client: Arc<dyn CompletionClient>, progress: Arc<ProgressRegistry>) -> Self {
        Self { client, progress }
    }

    /// Score `article` against every model in `config`.
    ///
    /// Returns the collected valid results and per-model failures, or a
    /// run-level error on cancellation / `handle_invalid = fail`.
    pub async fn run(
        &self,
        article: &Article,
        config: &Arc<EnsembleConfig>,
        cancel: &CancellationToken,
    ) -> Result<EngineOutcome, ScoreError> {
        let total = config.models.len();
        self.progress.update(
            article.id,
            ProgressPatch {
                status: Some(ProgressStatus::InProgress),
                step: Some("dispatch".to_string()),
                percent: Some(0),
                message: Some(format!("dispatching {total} model calls")),
                ..Default::default()
            },
        );

        let run_cancel = cancel.child_token();
        let pool = Arc::new(Semaphore::new(config.concurrency as usize));
        let completed = Arc::new(AtomicUsize::new(0));
        let fail_triggered = Arc::new(AtomicBool::new(false));
        let base_prompt = Arc::new(
            config
                .prompt_variant
                .render(&article.title, &article.content),
        );

        let mut handles = Vec::with_capacity(total);
        for model in config.models.clone() {
            let client = self.client.clone();
            let progress = self.progress.clone();
            let pool = pool.clone();
            let completed = completed.clone();
            let fail_triggered = fail_triggered.clone();
            let run_cancel = run_cancel.clone();
            let base_prompt = base_prompt.clone();
            let article_id = article.id;
            let policy = config.handle_invalid;
            let repair = config.repair_on_parse_failure;

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = pool.acquire().await else {
                    return Err(task_failure(&model, "cancelled", "worker pool closed"));
                };
                if run_cancel.is_cancelled() {
                    return Err(task_failure(&model, "cancelled", "run cancelled"));
                }

                progress.update(
                    article_id,
                    ProgressPatch {
                        step: Some(format!("scoring:{}", model.name)),
                        percent: Some(percent_of(completed.load(Ordering::Relaxed), total)),
                        ..Default::default()
                    },
                );

                let outcome =
                    score_one(&*client, &model, &base_prompt, repair, &run_cancel).await;

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                let message = match &outcome {
                    Ok(_) => format!("{}/{} models done", done, total),
                    Err(failure) => {
                        if policy == InvalidPolicy::Fail {
                            fail_triggered.store(true, Ordering::Relaxed);
                            run_cancel.cancel();
                        }
                        format!("model {} failed: {}", failure.model, failure.kind)
                    }
                };
                progress.update(
                    article_id,
                    ProgressPatch {
                        percent: Some(percent_of(done, total)),
                        message: Some(message),
                        ..Default::default()
                    },
                );
                outcome
            }));
        }

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (handle, model) in handles.into_iter().zip(config.models.iter()) {
            match handle.await {
                Ok(Ok(score)) => results.push(score),
                Ok(Err(failure)) => failures.push(failure),
                Err(e) => failures.push(ModelFailure {
                    model: model.name.clone(),
                    kind: "panic".to_string(),
                    message: e.to_string(),
                    retry_after_secs: None,
                }),
            }
        }

        if fail_triggered.load(Ordering::Relaxed) {
            return Err(ScoreError::ProviderUnavailable { failures });
        }
        if cancel.is_cancelled() {
            // The engine only sees its run token; the manager knows whether
            // the deadline or an explicit cancel fired it.
            return Err(ScoreError::Cancelled { by_deadline: false });
        }

        tracing::debug!(
            article_id = article.id,
            valid = results.len(),
            failed = failures.len(),
            "ensemble run collected"
        );
        Ok(EngineOutcome { results, failures })
    }
}

/// One model's full task: call, parse, optionally repair.
async fn score_one(
    client: &dyn CompletionClient,
    model: &ModelSpec,
    base_prompt: &str,
    repair: bool,
    cancel: &CancellationToken,
) -> Result<ModelScore, ModelFailure> {
    let prompt = format!(
        "{base_prompt}\n\nAdopt a {} analytical perspective for this assessment.",
        model.perspective.as_str()
    );

    let raw = call_cancellable(client, model, &prompt, cancel).await?;

    let (verdict, repaired) = match parser::parse(&raw) {
        Ok(verdict) => (verdict, false),
        Err(first_error) => {
            if !repair {
                return Err(task_failure(model, "parse_failure", &first_error.to_string()));
            }
            tracing::debug!(
                model = %model.name,
                error = %first_error,
                "parse failed, issuing repair call"
            );
            let strict = format!("{prompt}{REPAIR_INSTRUCTION}");
            let raw = call_cancellable(client, model, &strict, cancel).await?;
            match parser::parse(&raw) {
                Ok(verdict) => (verdict, true),
                Err(e) => {
                    return Err(task_failure(model, "parse_failure", &e.to_string()));
                }
            }
        }
    };

    Ok(ModelScore {
        model: model.name.clone(),
        perspective: model.perspective,
        weight: model.weight,
        score: verdict.score,
        confidence: verdict.confidence,
        explanation: verdict.explanation,
        metadata: serde_json::json!({
            "confidence_imputed": verdict.confidence_imputed,
            "repaired": repaired,
        }),
    })
}

/// Provider call raced against the run's cancellation token.
async fn call_cancellable(
    client: &dyn CompletionClient,
    model: &ModelSpec,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<String, ModelFailure> {
    tokio::select! {
        () = cancel.cancelled() => Err(task_failure(model, "cancelled", "run cancelled")),
        result = client.complete(model, prompt) => {
            result.map_err(|e| {
                let mut failure = task_failure(model, e.kind(), &e.to_string());
                if let crate::error::ProviderError::RateLimited { retry_after_secs } = e {
                    failure.retry_after_secs = retry_after_secs;
                }
                failure
            })
        }
    }
}

fn task_failure(model: &ModelSpec, kind: &str, message: &str) -> ModelFailure {
    ModelFailure {
        model: model.name.clone(),
        kind: kind.to_string(),
        message: message.to_string(),
        retry_after_secs: None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn percent_of(completed: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((100.0 * completed as f64 / total as f64).round()) as u8
    }
}
