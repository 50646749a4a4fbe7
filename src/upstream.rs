//! Calls to the upstream provider, with backoff when the provider rate limits us.
//!
//! Only `429 Too Many Requests` is retried. Every other response, successful or not, is handed
//! back to the caller untouched, and transport failures are surfaced immediately.
use crate::client::{BoxError, HttpClient};
use axum::body::{Body, Bytes};
use axum::http::{
    HeaderMap, HeaderValue, Method, Request, StatusCode, Uri,
    header::{AUTHORIZATION, CONTENT_TYPE, HOST, RETRY_AFTER},
};
use axum::response::Response;
use bon::Builder;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use url::Url;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com/v1/";
pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
pub const TRANSCRIPTIONS_PATH: &str = "audio/transcriptions";
pub const MODELS_PATH: &str = "models";

/// How long to keep retrying a rate-limited upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so at most `max_retries + 1` requests are sent.
    #[builder(default = 5)]
    pub max_retries: u32,
    /// First backoff step when upstream gives no `retry-after` hint.
    #[builder(default = Duration::from_secs(1))]
    pub base_delay: Duration,
    /// Upper bound on a computed backoff. Does not bound an explicit `retry-after`.
    #[builder(default = Duration::from_secs(16))]
    pub max_delay: Duration,
    /// Random jitter added to each computed backoff is drawn from `[0, max_jitter)`.
    #[builder(default = Duration::from_secs(1))]
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Backoff after the zero-based `attempt` failed: `min(base * 2^attempt + jitter, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Reads a provider `retry-after` hint given in (possibly fractional) seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    // Rejects negative, non-finite and out-of-range values.
    Duration::try_from_secs_f64(seconds).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("failed to reach upstream: {0}")]
    Transport(#[source] BoxError),
    #[error("failed to build upstream request: {0}")]
    Request(String),
}

/// A request to replay against the upstream provider. The body is kept as [`Bytes`] so every
/// attempt re-sends it in full without copying.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: &'static str,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn json<P: Serialize>(path: &'static str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::POST,
            path,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(payload)?.into(),
        })
    }

    pub fn get(path: &'static str) -> Self {
        Self {
            method: Method::GET,
            path,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn multipart(path: &'static str, content_type: String, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            path,
            content_type: Some(content_type),
            body,
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient<T> {
    http: T,
    base_url: Url,
    api_key: Arc<str>,
    retry: RetryPolicy,
}

impl<T> std::fmt::Debug for UpstreamClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"<redacted>")
            .field("retry", &self.retry)
            .finish()
    }
}

impl<T: HttpClient> UpstreamClient<T> {
    pub fn new(http: T, mut base_url: Url, api_key: impl Into<Arc<str>>, retry: RetryPolicy) -> Self {
        // Url::join replaces the last path segment unless the base ends in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn endpoint(&self, path: &str) -> Result<Uri, UpstreamError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        Uri::try_from(url.as_str()).map_err(|e| UpstreamError::Request(e.to_string()))
    }

    /// Send `req` upstream, retrying while upstream answers 429.
    #[instrument(skip(self, req), fields(method = %req.method, path = req.path))]
    pub async fn call(&self, req: &UpstreamRequest) -> Result<Response, UpstreamError> {
        let uri = self.endpoint(req.path)?;
        let mut attempt = 0;

        loop {
            let response = self
                .http
                .request(self.build_request(req, &uri)?)
                .await
                .map_err(|e| {
                    error!("Error forwarding request to {}: {}", uri, e);
                    UpstreamError::Transport(e)
                })?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                debug!(status = %response.status(), attempt, "Upstream responded");
                return Ok(response);
            }

            if attempt >= self.retry.max_retries {
                warn!(attempts = attempt + 1, "Upstream rate limit persisted, giving up");
                return Err(UpstreamError::RateLimited {
                    attempts: attempt + 1,
                });
            }

            let hint = retry_after(response.headers());
            let delay = hint.unwrap_or_else(|| self.retry.backoff(attempt));
            // Release the rate-limited response before sleeping.
            drop(response);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                from_header = hint.is_some(),
                "Upstream rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn build_request(
        &self,
        req: &UpstreamRequest,
        uri: &Uri,
    ) -> Result<axum::extract::Request, UpstreamError> {
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| UpstreamError::Request("API key is not a valid header value".into()))?;
        authorization.set_sensitive(true);

        let mut builder = Request::builder()
            .method(req.method.clone())
            .uri(uri.clone())
            .header(AUTHORIZATION, authorization);

        // Set the host header to the upstream's, otherwise fronting proxies reject the request.
        if let Some(host) = uri.host() {
            let host = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(HOST, host);
        }
        if let Some(content_type) = &req.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }

        builder
            .body(Body::from(req.body.clone()))
            .map_err(|e| UpstreamError::Request(e.to_string()))
    }
}
