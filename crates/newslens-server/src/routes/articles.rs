//! Article read and ingest endpoints.
//!
//! The feed collector lives outside this service; the ingest endpoint
//! stands in for it so the pipeline is drivable end-to-end.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use newslens_core::storage::{articles, scores};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /api/articles
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    if q.limit == 0 || q.limit > 200 {
        return Err(ApiError::BadRequest("limit must be in 1..=200".to_string()));
    }
    let rows = articles::list_articles(&state.db, q.limit, q.offset).await?;
    Ok(super::success(rows))
}

// ---------------------------------------------------------------------------
// GET /api/articles/{id}
// ---------------------------------------------------------------------------

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let article = articles::fetch_article(&state.db, id)
        .await?
        .ok_or(ApiError::Score(newslens_core::error::ScoreError::NotFound {
            article_id: id,
        }))?;
    let model_scores = scores::fetch_scores(&state.db, id).await?;

    Ok(super::success(json!({
        "article": article,
        "scores": model_scores,
    })))
}

// ---------------------------------------------------------------------------
// POST /api/articles
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct IngestRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub pub_date: String,
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.title.trim().is_empty() || body.content.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "title and content are required".to_string(),
        ));
    }

    let id = articles::insert_article(
        &state.db,
        &articles::NewArticle {
            title: body.title,
            content: body.content,
            source: body.source,
            pub_date: if body.pub_date.is_empty() {
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
            } else {
                body.pub_date
            },
        },
    )
    .await?;

    Ok((StatusCode::CREATED, super::success(json!({ "id": id }))))
}
