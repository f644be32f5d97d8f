//! newslens HTTP API server.
//!
//! Exposes the scoring subsystem over REST: reanalyze dispatch, a
//! server-sent-event progress stream, article read/ingest endpoints, and a
//! health check. Responses use the `{success, data, error}` envelope.

pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the complete axum router with all API routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health::health))
        // Articles
        .route(
            "/articles",
            get(routes::articles::list).post(routes::articles::ingest),
        )
        .route("/articles/{id}", get(routes::articles::get))
        // Scoring
        .route("/llm/reanalyze/{id}", post(routes::llm::reanalyze))
        .route("/llm/score-progress/{id}", get(routes::llm::score_progress));

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
