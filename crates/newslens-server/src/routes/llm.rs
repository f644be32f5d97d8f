//! Scoring endpoints: reanalyze and the live progress stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;

use newslens_core::error::ScoreError;
use newslens_core::storage::articles;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// POST /api/llm/reanalyze/{id}
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct ReanalyzeRequest {
    /// When present, sets the composite manually instead of dispatching
    /// the ensemble.
    pub score: Option<f64>,
}

pub async fn reanalyze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: ReanalyzeRequest = if body.is_empty() {
        ReanalyzeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
    };

    if let Some(score) = request.score {
        let composite = state.manager.set_manual_score(id, score).await?;
        return Ok((StatusCode::OK, super::success(composite)));
    }

    let config = state.manager.ensemble().current();
    if config.models.is_empty() {
        return Err(ApiError::Score(ScoreError::ProviderUnavailable {
            failures: vec![],
        }));
    }

    state.manager.rescore(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        super::success(json!({ "status": "reanalyze queued" })),
    ))
}

// ---------------------------------------------------------------------------
// GET /api/llm/score-progress/{id}
// ---------------------------------------------------------------------------

/// Server-sent-event stream of progress snapshots.
///
/// Sends the current snapshot first, then every update, and closes once a
/// terminal status has been delivered. A comment heartbeat keeps proxies
/// from reaping idle connections.
pub async fn score_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    articles::fetch_article(&state.db, id)
        .await?
        .ok_or(ApiError::Score(ScoreError::NotFound { article_id: id }))?;

    let (snapshot, rx) = state.manager.subscribe_progress(id);

    let updates = BroadcastStream::new(rx).filter_map(|item| async move {
        // Lagged receivers skip dropped events and continue.
        item.ok()
    });
    let mut terminal_sent = false;
    let states = futures::stream::once(async move { snapshot })
        .chain(updates)
        .take_while(move |progress| {
            let keep = !terminal_sent;
            if progress.status.is_terminal() {
                terminal_sent = true;
            }
            futures::future::ready(keep)
        });

    let events = states.map(|progress| {
        let event = match Event::default().json_data(&progress) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize progress event");
                Event::default().comment("serialization error")
            }
        };
        Ok(event)
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
