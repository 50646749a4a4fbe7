//! Configuration parsing and validation for the relay server
//!
//! Every option can be given as a flag or through the environment. The upstream API key is only
//! ever read from `OPENAI_API_KEY` or `--api-key` and is never printed.
use anyhow::anyhow;
use chat_relay::client::PoolConfig;
use chat_relay::rate_limit::RateLimitPolicy;
use chat_relay::upstream::{DEFAULT_UPSTREAM_URL, RetryPolicy};
use chat_relay::{DEFAULT_MAX_BODY_BYTES, RelaySettings, RouteTimeouts};
use clap::Parser;
use std::time::Duration;
use url::Url;

#[derive(Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the relay will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Credential for the upstream provider.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Base URL of the upstream provider's API.
    #[arg(long, env = "UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: Url,

    /// Largest request body accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// How many times a rate-limited upstream call is retried.
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Upper bound, in seconds, on a single computed backoff.
    #[arg(long, default_value_t = 16)]
    pub backoff_cap_secs: u64,

    /// Chat requests allowed per client in each window.
    #[arg(long, default_value_t = 20)]
    pub chat_limit: u32,

    #[arg(long, default_value_t = 60)]
    pub chat_window_secs: u64,

    /// Transcription requests allowed per client in each window.
    #[arg(long, default_value_t = 60)]
    pub transcribe_limit: u32,

    #[arg(long, default_value_t = 60)]
    pub transcribe_window_secs: u64,

    #[arg(long, default_value_t = 120)]
    pub chat_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub transcribe_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub models_timeout_secs: u64,

    /// How often, in seconds, expired rate limit entries are swept.
    #[arg(long, default_value_t = 60)]
    pub eviction_interval_secs: u64,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true, action = clap::ArgAction::Set)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "chat_relay")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("api_key", &"<redacted>")
            .field("upstream_url", &self.upstream_url.as_str())
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_retries", &self.max_retries)
            .field("backoff_cap_secs", &self.backoff_cap_secs)
            .field("chat_limit", &self.chat_limit)
            .field("chat_window_secs", &self.chat_window_secs)
            .field("transcribe_limit", &self.transcribe_limit)
            .field("transcribe_window_secs", &self.transcribe_window_secs)
            .field("chat_timeout_secs", &self.chat_timeout_secs)
            .field("transcribe_timeout_secs", &self.transcribe_timeout_secs)
            .field("models_timeout_secs", &self.models_timeout_secs)
            .field("eviction_interval_secs", &self.eviction_interval_secs)
            .field("metrics", &self.metrics)
            .field("metrics_port", &self.metrics_port)
            .field("metrics_prefix", &self.metrics_prefix)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("pool_idle_timeout_secs", &self.pool_idle_timeout_secs)
            .finish()
    }
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("An upstream API key is required (set OPENAI_API_KEY)"));
        }
        if !matches!(self.upstream_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Upstream URL '{}' must use http or https",
                self.upstream_url
            ));
        }
        for (name, value) in [
            ("chat-limit", u64::from(self.chat_limit)),
            ("chat-window-secs", self.chat_window_secs),
            ("transcribe-limit", u64::from(self.transcribe_limit)),
            ("transcribe-window-secs", self.transcribe_window_secs),
            ("chat-timeout-secs", self.chat_timeout_secs),
            ("transcribe-timeout-secs", self.transcribe_timeout_secs),
            ("models-timeout-secs", self.models_timeout_secs),
            ("eviction-interval-secs", self.eviction_interval_secs),
            ("max-body-bytes", self.max_body_bytes as u64),
        ] {
            if value == 0 {
                return Err(anyhow!("--{} must be greater than zero", name));
            }
        }
        Ok(self)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn settings(&self) -> RelaySettings {
        RelaySettings::builder()
            .api_key(self.api_key.trim())
            .upstream_url(self.upstream_url.clone())
            .retry(
                RetryPolicy::builder()
                    .max_retries(self.max_retries)
                    .max_delay(Duration::from_secs(self.backoff_cap_secs))
                    .build(),
            )
            .chat_limit(RateLimitPolicy::new(
                self.chat_limit,
                Duration::from_secs(self.chat_window_secs),
            ))
            .transcribe_limit(RateLimitPolicy::new(
                self.transcribe_limit,
                Duration::from_secs(self.transcribe_window_secs),
            ))
            .timeouts(RouteTimeouts {
                chat: Duration::from_secs(self.chat_timeout_secs),
                transcribe: Duration::from_secs(self.transcribe_timeout_secs),
                models: Duration::from_secs(self.models_timeout_secs),
            })
            .max_body_bytes(self.max_body_bytes)
            .pool(PoolConfig {
                max_idle_per_host: self.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            })
            .build()
    }
}
