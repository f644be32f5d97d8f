//! Per-model score persistence.
//!
//! Enforces the `UNIQUE(article_id, model)` rule: a rescored model upserts
//! its row in place and bumps `version`. All writes of one scoring run
//! commit as a single transaction so observers never see a partial mix of
//! old and new results.

use super::DbPool;
use crate::error::StorageError;
use crate::scoring::{CompositeScore, ModelScore};
use std::time::Duration;

/// Retry budget for write transactions hitting SQLite busy/locked errors.
const TX_ATTEMPTS: u32 = 3;
const TX_BACKOFF: Duration = Duration::from_millis(50);

/// A persisted per-model score row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ScoreRow {
    /// Primary key.
    pub id: i64,
    /// The scored article.
    pub article_id: i64,
    /// Model name (unique per article).
    pub model: String,
    /// Bias verdict in [-1, 1].
    pub score: f64,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// JSON blob: explanation, perspective, weight, imputation markers.
    pub metadata: String,
    /// Bumped on every upsert of the same (article, model) pair.
    pub version: i64,
    /// ISO-8601 UTC timestamp of the latest write.
    pub created_at: String,
}

/// All score rows for an article, ordered by model name. Read-API path;
/// the scoring path never reads back its own writes.
pub async fn fetch_scores(pool: &DbPool, article_id: i64) -> Result<Vec<ScoreRow>, StorageError> {
    sqlx::query_as::<_, ScoreRow>(
        "SELECT * FROM llm_scores WHERE article_id = ? ORDER BY model",
    )
    .bind(article_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Upsert a batch of per-model results atomically.
pub async fn upsert_scores(
    pool: &DbPool,
    article_id: i64,
    results: &[ModelScore],
) -> Result<(), StorageError> {
    with_retries(|| async move {
        let mut tx = pool.begin().await?;
        insert_rows(&mut tx, article_id, results).await?;
        tx.commit().await
    })
    .await
}

/// Commit one scoring run: per-model upserts, the article composite, and the
/// `scored` status, all in a single transaction.
pub async fn commit_run(
    pool: &DbPool,
    results: &[ModelScore],
    composite: &CompositeScore,
) -> Result<(), StorageError> {
    with_retries(|| async move {
        let mut tx = pool.begin().await?;
        insert_rows(&mut tx, composite.article_id, results).await?;
        sqlx::query(
            "UPDATE articles SET composite_score = ?, confidence = ?, \
             score_source = ?, scored_at = ?, status = 'scored' WHERE id = ?",
        )
        .bind(composite.score)
        .bind(composite.confidence)
        .bind(composite.source.as_str())
        .bind(&composite.scored_at)
        .bind(composite.article_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    })
    .await
}

async fn insert_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    article_id: i64,
    results: &[ModelScore],
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    for result in results {
        sqlx::query(
            "INSERT INTO llm_scores (article_id, model, score, confidence, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(article_id, model) DO UPDATE SET \
               score = excluded.score, \
               confidence = excluded.confidence, \
               metadata = excluded.metadata, \
               created_at = excluded.created_at, \
               version = llm_scores.version + 1",
        )
        .bind(article_id)
        .bind(&result.model)
        .bind(result.score)
        .bind(result.confidence)
        .bind(metadata_json(result))
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Flatten a result's explanation and lens into its persisted metadata blob.
fn metadata_json(result: &ModelScore) -> String {
    let mut metadata = match &result.metadata {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    metadata.insert(
        "explanation".to_string(),
        serde_json::Value::String(result.explanation.clone()),
    );
    metadata.insert(
        "perspective".to_string(),
        serde_json::Value::String(result.perspective.as_str().to_string()),
    );
    if let Some(weight) = serde_json::Number::from_f64(result.weight) {
        metadata.insert("weight".to_string(), serde_json::Value::Number(weight));
    }
    serde_json::Value::Object(metadata).to_string()
}

/// Run a write closure with back-off retries on busy/locked errors.
async fn with_retries<F, Fut>(mut op: F) -> Result<(), StorageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < TX_ATTEMPTS && is_busy(&e) => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "retrying busy write transaction");
                tokio::time::sleep(TX_BACKOFF).await;
            }
            Err(e) => {
                return Err(if attempt > 0 {
                    StorageError::Transaction {
                        attempts: attempt + 1,
                        source: e,
                    }
                } else {
                    StorageError::Query { source: e }
                });
            }
        }
    }
}

/// SQLite signals write contention as "database is locked" / "busy".
fn is_busy(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if {
        let message = db.message().to_lowercase();
        message.contains("locked") || message.contains("busy")
    })
}
