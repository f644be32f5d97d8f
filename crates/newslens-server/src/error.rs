//! API error types for the newslens server.
//!
//! Maps core domain errors to HTTP status codes and the JSON error envelope
//! `{success: false, error: {code, message, trace_id}}`. Every response
//! carries a fresh trace id that is also logged server-side.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use newslens_core::error::{ScoreError, StorageError};
use serde_json::json;

/// API error type for route handlers.
pub enum ApiError {
    /// A scoring-subsystem error with its own taxonomy.
    Score(ScoreError),
    /// Internal storage/database error on a read path.
    Storage(StorageError),
    /// Bad request (invalid query parameters, body, etc.).
    BadRequest(String),
}

impl From<ScoreError> for ApiError {
    fn from(err: ScoreError) -> Self {
        Self::Score(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// HTTP status for a stable scoring error code.
///
/// `cancelled` here covers negative-cache replays, which lose the cause;
/// live cancellations are mapped from the typed error in `status_for_score`.
fn status_for(code: &str) -> StatusCode {
    match code {
        "not_found" => StatusCode::NOT_FOUND,
        "invalid" => StatusCode::BAD_REQUEST,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "provider_unavailable" | "scoring_disabled" => StatusCode::SERVICE_UNAVAILABLE,
        "cancelled" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP status for a typed scoring error.
///
/// Cancellation splits by cause: 504 when the run deadline fired, 499
/// (client closed request) for explicit cancellation.
fn status_for_score(error: &ScoreError) -> StatusCode {
    match error {
        ScoreError::Cancelled { by_deadline: true } => StatusCode::GATEWAY_TIMEOUT,
        ScoreError::Cancelled { by_deadline: false } => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
        }
        other => status_for(other.code()),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = uuid::Uuid::new_v4().to_string();

        let (status, code, message, details, retry_after) = match self {
            Self::Score(e) => {
                let code = e.code().to_string();
                let status = status_for_score(&e);
                let (details, retry_after) = match &e {
                    ScoreError::ProviderUnavailable { failures } => (
                        Some(json!({ "failures": failures })),
                        None,
                    ),
                    ScoreError::RateLimited { retry_after_secs } => (None, *retry_after_secs),
                    _ => (None, None),
                };
                if status.is_server_error() {
                    tracing::error!(trace_id = %trace_id, error = %e, "scoring error");
                } else {
                    tracing::debug!(trace_id = %trace_id, error = %e, "scoring request rejected");
                }
                (status, code, e.to_string(), details, retry_after)
            }
            Self::Storage(e) => {
                tracing::error!(trace_id = %trace_id, error = %e, "storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "persistence".to_string(),
                    e.to_string(),
                    None,
                    None,
                )
            }
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                "invalid".to_string(),
                message,
                None,
                None,
            ),
        };

        let mut error = json!({
            "code": code,
            "message": message,
            "trace_id": trace_id,
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        let body = axum::Json(json!({ "success": false, "error": error }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
