//! Mapping from internal errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use snooscope_core::ScrapeError;

/// API-facing error. Sensitive detail never survives into a 5xx body.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Unavailable,
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ScrapeError> for ApiError {
    fn from(err: ScrapeError) -> Self {
        match err {
            ScrapeError::NotFound { what } => ApiError::NotFound(what),
            ScrapeError::Permanent { message } => ApiError::Validation(message),
            ScrapeError::StoreBusy | ScrapeError::CircuitOpen { .. } => ApiError::Unavailable,
            other => {
                tracing::error!(%other, "internal error surfaced to API");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Validation(message) => message,
            ApiError::NotFound(what) => format!("not found: {what}"),
            ApiError::Unavailable => "temporarily unavailable".to_string(),
            ApiError::Internal => "internal error".to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
