//! Route modules for the newslens API server.

pub mod articles;
pub mod health;
pub mod llm;

use serde_json::json;

/// Wrap a payload in the `{success: true, data}` envelope.
pub fn success<T: serde::Serialize>(data: T) -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "success": true, "data": data }))
}
