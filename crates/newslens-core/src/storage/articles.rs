//! CRUD operations for articles.
//!
//! Articles are created by the external feed collector (or the ingest API);
//! the scoring subsystem reads them and owns the status and composite
//! columns.

use super::DbPool;
use crate::error::StorageError;
use crate::scoring::CompositeScore;

/// Article lifecycle states as persisted in `articles.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleStatus {
    New,
    Scoring,
    Scored,
    Failed,
}

impl ArticleStatus {
    /// Lowercase form as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scoring => "scoring",
            Self::Scored => "scored",
            Self::Failed => "failed",
        }
    }

    /// Parse the persisted form back.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "scoring" => Some(Self::Scoring),
            "scored" => Some(Self::Scored),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An article row, composite columns included.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Article {
    /// Primary key.
    pub id: i64,
    /// Headline.
    pub title: String,
    /// Full article text.
    pub content: String,
    /// Feed or publisher name.
    pub source: String,
    /// ISO-8601 publication timestamp from the feed.
    pub pub_date: String,
    /// Lifecycle status (`new`, `scoring`, `scored`, `failed`).
    pub status: String,
    /// Composite bias score, when scored.
    pub composite_score: Option<f64>,
    /// Composite confidence, when scored.
    pub confidence: Option<f64>,
    /// Composite provenance (`ensemble`, `manual`, `default`).
    pub score_source: Option<String>,
    /// ISO-8601 timestamp of the composite.
    pub scored_at: Option<String>,
}

/// Fields for inserting a new article.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub content: String,
    pub source: String,
    pub pub_date: String,
}

/// Insert an article in status `new`, returning its id.
pub async fn insert_article(pool: &DbPool, article: &NewArticle) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO articles (title, content, source, pub_date, status) \
         VALUES (?, ?, ?, ?, 'new')",
    )
    .bind(&article.title)
    .bind(&article.content)
    .bind(&article.source)
    .bind(&article.pub_date)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a single article by id. Returns `None` if not found.
pub async fn fetch_article(pool: &DbPool, id: i64) -> Result<Option<Article>, StorageError> {
    sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Single-row status update.
pub async fn set_status(
    pool: &DbPool,
    id: i64,
    status: ArticleStatus,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE articles SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    Ok(())
}

/// Write a composite onto the article row without touching per-model scores.
///
/// Used by the manual-override path; the ensemble path commits its composite
/// together with the per-model upserts in [`super::scores::commit_run`].
pub async fn update_composite(
    pool: &DbPool,
    composite: &CompositeScore,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE articles SET composite_score = ?, confidence = ?, \
         score_source = ?, scored_at = ?, status = 'scored' WHERE id = ?",
    )
    .bind(composite.score)
    .bind(composite.confidence)
    .bind(composite.source.as_str())
    .bind(&composite.scored_at)
    .bind(composite.article_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(())
}

/// Newest articles first, for the read API.
pub async fn list_articles(
    pool: &DbPool,
    limit: u32,
    offset: u32,
) -> Result<Vec<Article>, StorageError> {
    sqlx::query_as::<_, Article>(
        "SELECT * FROM articles ORDER BY pub_date DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}
