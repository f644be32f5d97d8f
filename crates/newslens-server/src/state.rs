//! Shared application state for the newslens server.

use std::sync::Arc;

use newslens_core::scoring::manager::ScoreManager;
use newslens_core::storage::DbPool;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// SQLite connection pool for read endpoints.
    pub db: DbPool,
    /// The scoring orchestrator.
    pub manager: Arc<ScoreManager>,
}
