/// Axum handlers for the relay routes
use crate::client::HttpClient;
use crate::errors::ApiError;
use crate::relay::relay;
use crate::sanitize::sanitize;
use crate::transcribe::TranscriptionRequest;
use crate::upstream::{CHAT_COMPLETIONS_PATH, MODELS_PATH, UpstreamRequest};
use crate::validation::validate;
use crate::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{header::CONTENT_LENGTH, header::CONTENT_TYPE, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Rate limiting key for a request: the peer address as seen by this server.
///
/// No forwarding headers are consulted, so clients behind a shared proxy share one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    pub const UNKNOWN: &'static str = "unknown";
}

impl<S: Send + Sync> FromRequestParts<S> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| Self::UNKNOWN.to_string());
        Ok(ClientKey(key))
    }
}

/// POST /chat: single-shot completion, upstream status and body mirrored back.
#[instrument(skip(state, req))]
pub async fn chat<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    client: ClientKey,
    req: axum::extract::Request,
) -> Result<Response, ApiError> {
    if state.limits.chat.is_limited(&client.0) {
        warn!("Chat rate limit exceeded");
        return Err(ApiError::RateLimited);
    }

    with_timeout(state.timeouts.chat, async {
        let body = read_json(req, state.max_body_bytes).await?;
        validate(&body)?;
        let payload = sanitize(&body);
        info!(model = %payload.model, messages = payload.messages.len(), "Forwarding chat request");

        let request = UpstreamRequest::json(CHAT_COMPLETIONS_PATH, &payload)?;
        let response = state.upstream.call(&request).await?;
        passthrough(response, state.max_body_bytes).await
    })
    .await
}

/// POST /chat/stream: relays the upstream event stream as it arrives.
///
/// Anything that goes wrong before the upstream stream is open is reported as a JSON error.
/// Once the relay starts, failures can only close the connection.
#[instrument(skip(state, req))]
pub async fn chat_stream<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    client: ClientKey,
    req: axum::extract::Request,
) -> Result<Response, ApiError> {
    if state.limits.chat.is_limited(&client.0) {
        warn!("Chat rate limit exceeded");
        return Err(ApiError::RateLimited);
    }

    let body = read_json(req, state.max_body_bytes).await?;
    validate(&body)?;
    let payload = sanitize(&body).streaming();
    info!(model = %payload.model, messages = payload.messages.len(), "Opening chat stream");

    let request = UpstreamRequest::json(CHAT_COMPLETIONS_PATH, &payload)?;
    let response = state.upstream.call(&request).await?;
    if !response.status().is_success() {
        warn!(status = %response.status(), "Upstream refused stream");
        return Err(ApiError::from_upstream(response, state.max_body_bytes).await);
    }

    Ok(relay(response, state.shutdown.child_token()))
}

/// POST /audio/transcribe: base64 audio in, upstream transcription JSON out.
#[instrument(skip(state, req))]
pub async fn transcribe<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    client: ClientKey,
    req: axum::extract::Request,
) -> Result<Response, ApiError> {
    if state.limits.transcribe.is_limited(&client.0) {
        warn!("Transcription rate limit exceeded");
        return Err(ApiError::RateLimited);
    }

    with_timeout(state.timeouts.transcribe, async {
        let body = read_json(req, state.max_body_bytes).await?;
        let audio = TranscriptionRequest::from_json(&body)?;
        info!(
            bytes = audio.audio.len(),
            mime_type = %audio.mime_type,
            "Forwarding transcription request"
        );

        let response = state.upstream.call(&audio.into_upstream_request()).await?;
        passthrough(response, state.max_body_bytes).await
    })
    .await
}

/// GET /models: upstream model list, passed through.
#[instrument(skip(state))]
pub async fn models<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
) -> Result<Response, ApiError> {
    with_timeout(state.timeouts.models, async {
        let response = state.upstream.call(&UpstreamRequest::get(MODELS_PATH)).await?;
        passthrough(response, state.max_body_bytes).await
    })
    .await
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn with_timeout<F>(limit: Duration, work: F) -> Result<Response, ApiError>
where
    F: Future<Output = Result<Response, ApiError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Request exceeded {}s timeout", limit.as_secs());
            Err(ApiError::Timeout)
        }
    }
}

/// Buffer the request body, bounded by `limit`, and parse it as JSON.
async fn read_json(req: axum::extract::Request, limit: usize) -> Result<Value, ApiError> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(ApiError::PayloadTooLarge);
    }

    let bytes = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| {
            warn!("Failed to read request body: {}", e);
            ApiError::PayloadTooLarge
        })?;
    debug!("Received request body of size: {}", bytes.len());

    serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("Invalid body".into()))
}

/// Read an upstream response, up to `limit` bytes, and mirror its status and body.
async fn passthrough(response: Response, limit: usize) -> Result<Response, ApiError> {
    if !response.status().is_success() {
        warn!(status = %response.status(), "Upstream returned an error");
        return Err(ApiError::from_upstream(response, limit).await);
    }

    let status = response.status();
    let body: Bytes = axum::body::to_bytes(response.into_body(), limit)
        .await
        .map_err(|e| {
            warn!("Failed to read upstream response body: {}", e);
            ApiError::Internal
        })?;

    Ok((status, [(CONTENT_TYPE, "application/json")], body).into_response())
}
