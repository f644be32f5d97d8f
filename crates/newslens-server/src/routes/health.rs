//! Health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/health` — database reachability and ensemble readiness.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let db_ok = newslens_core::storage::ping(&state.db).await.is_ok();
    let config = state.manager.ensemble().current();

    Ok(super::success(json!({
        "status": if db_ok && !config.models.is_empty() { "ok" } else { "degraded" },
        "version": newslens_core::version(),
        "db": db_ok,
        "models": config.models.len(),
        "config_version": config.version,
    })))
}
