//! Route-level errors and the JSON envelope they render to.
//!
//! Every failure a client can observe before a stream starts is an [`ApiError`], rendered as
//! `{"error": {"message": "..."}}`. The exception is [`ApiError::Upstream`], which mirrors the
//! provider's status and body verbatim.
use crate::transcribe::TranscriptionError;
use crate::upstream::UpstreamError;
use crate::validation::ValidationError;
use axum::Json;
use axum::body::Bytes;
use axum::http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transcription(#[from] TranscriptionError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Too many requests, please try again later")]
    RateLimited,
    #[error("Rate limit exceeded, please try again later")]
    UpstreamRateLimited,
    #[error("Upstream responded with {status}")]
    Upstream {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        body: Bytes,
    },
    #[error("Internal server error")]
    Internal,
    #[error("Request timed out")]
    Timeout,
    #[error("Not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Transcription(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited | ApiError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream { status, .. } => *status,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Capture a non-success upstream response so it can be passed through as-is.
    ///
    /// Bodies over `limit` bytes are not buffered and become [`ApiError::Internal`].
    pub async fn from_upstream(response: Response, limit: usize) -> Self {
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        match axum::body::to_bytes(response.into_body(), limit).await {
            Ok(body) => ApiError::Upstream {
                status,
                content_type,
                body,
            },
            Err(e) => {
                error!("Failed to read upstream error body ({}): {}", status, e);
                ApiError::Internal
            }
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited { .. } => ApiError::UpstreamRateLimited,
            // Details stay in the logs.
            UpstreamError::Transport(_) | UpstreamError::Request(_) => {
                error!("Upstream call failed: {}", err);
                ApiError::Internal
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        error!("Failed to serialize upstream payload: {}", err);
        ApiError::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Upstream {
                status,
                content_type,
                body,
            } => {
                let content_type =
                    content_type.unwrap_or_else(|| HeaderValue::from_static("application/json"));
                (status, [(CONTENT_TYPE, content_type)], body).into_response()
            }
            other => {
                let body = json!({ "error": { "message": other.to_string() } });
                (other.status(), Json(body)).into_response()
            }
        }
    }
}
