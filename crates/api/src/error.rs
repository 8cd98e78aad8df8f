//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use queue::QueueError;
use store::StoreError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// The entity is in a state that does not allow the request.
    #[error("{0}")]
    Conflict(String),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The saga's first step could not be enqueued.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Store(err) => {
                tracing::error!(error = %err, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Queue(err) => {
                tracing::error!(error = %err, "enqueue failure");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
