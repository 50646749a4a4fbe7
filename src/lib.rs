//! Chat Relay - a validating, rate-limited relay for hosted chat completion APIs
//!
//! This library provides the request validation, payload sanitization, upstream retry handling,
//! rate limiting and streaming relay that sit between browser clients and the provider.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use url::Url;

pub mod client;
pub mod errors;
pub mod handlers;
pub mod rate_limit;
pub mod relay;
pub mod sanitize;
pub mod sse;
pub mod transcribe;
pub mod upstream;
pub mod validation;

use client::{HttpClient, HyperClient, PoolConfig};
use handlers::{chat, chat_stream, health, models, not_found, transcribe};
use rate_limit::{RateLimitPolicy, RateLimiter};
use upstream::{RetryPolicy, UpstreamClient};

pub const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Per-route deadlines for the buffered routes. Streaming is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTimeouts {
    pub chat: Duration,
    pub transcribe: Duration,
    pub models: Duration,
}

impl Default for RouteTimeouts {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(120),
            transcribe: Duration::from_secs(60),
            models: Duration::from_secs(30),
        }
    }
}

/// Everything needed to assemble an [`AppState`].
#[derive(Clone, Builder)]
pub struct RelaySettings {
    #[builder(into)]
    pub api_key: String,
    pub upstream_url: Url,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default = RateLimitPolicy::new(20, Duration::from_secs(60)))]
    pub chat_limit: RateLimitPolicy,
    #[builder(default = RateLimitPolicy::new(60, Duration::from_secs(60)))]
    pub transcribe_limit: RateLimitPolicy,
    #[builder(default)]
    pub timeouts: RouteTimeouts,
    #[builder(default = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,
    #[builder(default)]
    pub pool: PoolConfig,
}

/// Rate limiters, one table per route group.
#[derive(Debug, Clone)]
pub struct RouteLimits {
    pub chat: Arc<RateLimiter>,
    pub transcribe: Arc<RateLimiter>,
}

/// The main application state shared by every handler
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub upstream: UpstreamClient<T>,
    pub limits: RouteLimits,
    pub timeouts: RouteTimeouts,
    pub max_body_bytes: usize,
    /// Cancelled on shutdown; every open relay listens on a child token.
    pub shutdown: CancellationToken,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: RelaySettings) -> Self {
        let http_client = client::create_hyper_client(settings.pool);
        Self::with_client(settings, http_client)
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: RelaySettings, http_client: T) -> Self {
        Self {
            upstream: UpstreamClient::new(
                http_client,
                settings.upstream_url,
                settings.api_key,
                settings.retry,
            ),
            limits: RouteLimits {
                chat: Arc::new(RateLimiter::new(settings.chat_limit)),
                transcribe: Arc::new(RateLimiter::new(settings.transcribe_limit)),
            },
            timeouts: settings.timeouts,
            max_body_bytes: settings.max_body_bytes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start background eviction for every rate limit table.
    pub fn spawn_rate_limit_eviction(&self, every: Duration) -> Vec<JoinHandle<()>> {
        vec![
            self.limits.chat.spawn_eviction(every),
            self.limits.transcribe.spawn_eviction(every),
        ]
    }
}

/// Build the main router for the relay
/// This creates routes for:
/// - `/chat` and `/chat/stream` - Validated chat completions, buffered or streamed
/// - `/audio/transcribe` - Speech to text
/// - `/models` - Upstream model list
/// - `/health` - Liveness check
///
/// Anything else, including a known path with the wrong method, gets the JSON 404 envelope.
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/chat", post(chat).fallback(not_found))
        .route("/chat/stream", post(chat_stream).fallback(not_found))
        .route("/audio/transcribe", post(transcribe).fallback(not_found))
        .route("/models", get(models).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix must live for the rest of the program, as the Prometheus registry is global.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine as _;
    use serde_json::{Value, json};
    use test_utils::{MockHttpClient, MockResponse};
    use axum_test::TestServer;
    use tower::ServiceExt;

    fn settings() -> RelaySettings {
        RelaySettings::builder()
            .api_key("sk-test-key")
            .upstream_url(Url::parse("https://api.example.com/v1/").unwrap())
            .retry(RetryPolicy::builder().max_jitter(Duration::ZERO).build())
            .build()
    }

    fn server(mock: &MockHttpClient) -> TestServer {
        let router = build_router(AppState::with_client(settings(), mock.clone()));
        TestServer::new(router).unwrap()
    }

    fn chat_body() -> Value {
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        })
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected_before_upstream() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        let response = server
            .post("/chat")
            .json(&json!({
                "model": "gpt-5-turbo-ultra",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Unknown model"}})
        );
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        let response = server.post("/chat").text("{not json").await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Invalid body"}})
        );
    }

    #[tokio::test]
    async fn test_chat_passes_upstream_response_through() {
        let upstream_body = r#"{"id": "chatcmpl-1", "choices": [{"message": {"content": "Hello from upstream!"}}]}"#;
        let mock = MockHttpClient::new(StatusCode::OK, upstream_body);
        let server = server(&mock);

        let response = server.post("/chat").json(&chat_body()).await;

        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["id"], "chatcmpl-1");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello from upstream!");
    }

    #[tokio::test]
    async fn test_chat_forwards_sanitized_payload() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        let response = server
            .post("/chat")
            .json(&json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Hi", "name": "mallory"}],
                "temperature": 9,
                "max_tokens": 1_000_000,
                "tools": [{"type": "function"}],
                "stream": true
            }))
            .await;
        assert_eq!(response.status_code(), 200);

        let requests = mock.get_requests();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.uri, "https://api.example.com/v1/chat/completions");
        assert_eq!(sent.header("authorization"), Some("Bearer sk-test-key"));

        let payload: Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(
            payload,
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Hi"}],
                "temperature": 2.0,
                "max_tokens": 16384
            })
        );
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_mirrored() {
        let mock = MockHttpClient::new(
            StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "Incorrect API key provided"}}"#,
        );
        let server = server(&mock);

        let response = server.post("/chat").json(&chat_body()).await;

        assert_eq!(response.status_code(), 401);
        assert_eq!(
            response.json::<Value>()["error"]["message"],
            "Incorrect API key provided"
        );
    }

    #[tokio::test]
    async fn test_twenty_first_chat_request_is_rate_limited() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        for _ in 0..20 {
            let response = server.post("/chat").json(&chat_body()).await;
            assert_eq!(response.status_code(), 200);
        }

        let response = server.post("/chat").json(&chat_body()).await;
        assert_eq!(response.status_code(), 429);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Too many requests, please try again later"}})
        );
        assert_eq!(mock.get_requests().len(), 20);

        // The transcription limit is tracked separately.
        let response = server
            .post("/audio/transcribe")
            .json(&json!({"audio": base64::engine::general_purpose::STANDARD.encode(b"RIFF")}))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    #[tokio::test]
    async fn test_upstream_rate_limit_exhaustion() {
        let mock = MockHttpClient::new(StatusCode::TOO_MANY_REQUESTS, "{}");
        let mut settings = settings();
        settings.retry = RetryPolicy::builder()
            .max_retries(2)
            .base_delay(Duration::ZERO)
            .max_jitter(Duration::ZERO)
            .build();
        let server = TestServer::new(build_router(AppState::with_client(settings, mock.clone()))).unwrap();

        let response = server.post("/chat").json(&chat_body()).await;

        assert_eq!(response.status_code(), 429);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Rate limit exceeded, please try again later"}})
        );
        assert_eq!(mock.get_requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}").with_delay(Duration::from_secs(600));
        let router = build_router(AppState::with_client(settings(), mock));

        let request = Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from(chat_body().to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"error": {"message": "Request timed out"}}));
    }

    #[tokio::test]
    async fn test_stream_relays_upstream_events() {
        let chunks = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n".to_string(),
            "data: [DONE]\n\n".to_string(),
        ];
        let mock = MockHttpClient::new_streaming(StatusCode::OK, chunks.clone());
        let server = server(&mock);

        let response = server.post("/chat/stream").json(&chat_body()).await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("content-type"), "text/event-stream");
        assert_eq!(response.header("cache-control"), "no-cache");
        assert_eq!(response.text(), chunks.concat());

        let payload: Value = serde_json::from_slice(&mock.get_requests()[0].body).unwrap();
        assert_eq!(payload["stream"], true);
    }

    #[tokio::test]
    async fn test_stream_reports_upstream_failure_as_json() {
        let mock = MockHttpClient::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error": {"message": "The server had an error"}}"#,
        );
        let server = server(&mock);

        let response = server.post("/chat/stream").json(&chat_body()).await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "The server had an error"}})
        );
    }

    #[tokio::test]
    async fn test_stream_transport_failure() {
        let mock = MockHttpClient::failing("connection reset by peer");
        let server = server(&mock);

        let response = server.post("/chat/stream").json(&chat_body()).await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Internal server error"}})
        );
    }

    #[tokio::test]
    async fn test_transcribe_sends_multipart_upload() {
        let mock = MockHttpClient::new(StatusCode::OK, r#"{"text": "hello world"}"#);
        let server = server(&mock);

        let response = server
            .post("/audio/transcribe")
            .json(&json!({
                "audio": base64::engine::general_purpose::STANDARD.encode(b"OggS-audio"),
                "mimeType": "audio/ogg",
                "language": "en"
            }))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), json!({"text": "hello world"}));

        let requests = mock.get_requests();
        let sent = &requests[0];
        assert_eq!(sent.uri, "https://api.example.com/v1/audio/transcriptions");
        assert!(
            sent.header("content-type")
                .unwrap()
                .starts_with("multipart/form-data; boundary=")
        );
        let body = String::from_utf8_lossy(&sent.body);
        assert!(body.contains("filename=\"audio.ogg\""));
        assert!(body.contains("OggS-audio"));
        assert!(body.contains("whisper-1"));
    }

    #[tokio::test]
    async fn test_transcribe_missing_audio() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        let response = server.post("/audio/transcribe").json(&json!({})).await;

        assert_eq!(response.status_code(), 400);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Missing audio"}})
        );
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_models_passthrough() {
        let upstream_body = r#"{"object": "list", "data": [{"id": "gpt-4o", "object": "model"}]}"#;
        let mock = MockHttpClient::new(StatusCode::OK, upstream_body);
        let server = server(&mock);

        let response = server.get("/models").await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>()["data"][0]["id"], "gpt-4o");
        let requests = mock.get_requests();
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].uri, "https://api.example.com/v1/models");
    }

    #[tokio::test]
    async fn test_oversized_upstream_body_is_not_buffered() {
        let huge = format!(r#"{{"object": "list", "data": ["{}"]}}"#, "m".repeat(4096));
        let mock = MockHttpClient::new(StatusCode::OK, &huge);
        let mut settings = settings();
        settings.max_body_bytes = 1024;
        let server = TestServer::new(build_router(AppState::with_client(settings, mock))).unwrap();

        let response = server.get("/models").await;

        assert_eq!(response.status_code(), 500);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": {"message": "Internal server error"}})
        );
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method_are_404() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let server = server(&mock);

        for response in [
            server.get("/v1/chat/completions").await,
            server.get("/chat").await,
            server.post("/models").await,
        ] {
            assert_eq!(response.status_code(), 404);
            assert_eq!(
                response.json::<Value>(),
                json!({"error": {"message": "Not found"}})
            );
        }
        assert!(mock.get_requests().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let mock = MockHttpClient::new(StatusCode::OK, "{}");
        let response = server(&mock).get("/health").await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_upstream_retry_then_success_through_router() {
        let mock = MockHttpClient::with_sequence(vec![
            MockResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}").header("retry-after", "0"),
            MockResponse::new(StatusCode::OK, r#"{"id": "after-retry"}"#),
        ]);
        let server = server(&mock);

        let response = server.post("/chat").json(&chat_body()).await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>()["id"], "after-retry");
        assert_eq!(mock.get_requests().len(), 2);
    }

    mod metrics {
        use super::*;
        use rstest::*;

        /// axum-prometheus installs a global recorder, so all metrics tests share one pair of
        /// servers.
        #[fixture]
        #[once]
        fn get_shared_metrics_servers() -> (TestServer, TestServer) {
            let (prometheus_layer, handle) = build_metrics_layer_and_handle("chat_relay");

            let metrics_router = build_metrics_router(handle);
            let metrics_server = TestServer::new(metrics_router).unwrap();

            let mock = MockHttpClient::new(StatusCode::OK, r#"{"object": "list", "data": []}"#);
            let router = build_router(AppState::with_client(settings(), mock)).layer(prometheus_layer);
            let server = TestServer::new(router).unwrap();

            (server, metrics_server)
        }

        fn request_count(metrics: &str, series: &str) -> i32 {
            metrics
                .lines()
                .find(|line| line.contains(series))
                .and_then(|line| line.split_whitespace().last())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_count_models_requests(
            get_shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = get_shared_metrics_servers;
            let series = "chat_relay_http_requests_total{method=\"GET\",status=\"200\",endpoint=\"/models\"}";

            let initial = request_count(&metrics_server.get("/metrics").await.text(), series);

            for _ in 0..5 {
                let response = server.get("/models").await;
                assert_eq!(response.status_code(), 200);
            }

            let response = metrics_server.get("/metrics").await;
            assert_eq!(response.status_code(), 200);
            assert_eq!(request_count(&response.text(), series), initial + 5);
        }

        #[rstest]
        #[tokio::test]
        async fn test_metrics_count_rejected_requests(
            get_shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = get_shared_metrics_servers;
            let series = "chat_relay_http_requests_total{method=\"POST\",status=\"400\",endpoint=\"/chat\"}";

            let initial = request_count(&metrics_server.get("/metrics").await.text(), series);

            let response = server
                .post("/chat")
                .json(&json!({"model": "not-a-model", "messages": []}))
                .await;
            assert_eq!(response.status_code(), 400);

            let response = metrics_server.get("/metrics").await;
            assert_eq!(request_count(&response.text(), series), initial + 1);
        }
    }
}
