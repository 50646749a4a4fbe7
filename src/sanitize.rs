//! Reduction of a validated chat request to the exact payload sent upstream.
//!
//! The payload is rebuilt field by field from a whitelist rather than forwarded as received, so
//! a client cannot smuggle extra provider parameters (`n`, `tools`, `logit_bias`, ...) through
//! the relay, and the numeric knobs that drive upstream cost are always bounded.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;
pub const DEFAULT_MAX_TOKENS: u64 = 4096;
pub const MAX_TOKENS_CAP: u64 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpstreamContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: Role,
    pub content: UpstreamContent,
}

/// The only shape of chat request the relay ever sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPayload {
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    /// Set by the streaming route only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl UpstreamPayload {
    pub fn streaming(mut self) -> Self {
        self.stream = Some(true);
        self
    }
}

/// Rebuild a request body into an [`UpstreamPayload`].
///
/// Intended for bodies that already passed [`crate::validation::validate`]. Anything that would
/// not have passed validation is dropped rather than forwarded: messages with an unknown role or
/// malformed content, and content parts of an unknown kind.
pub fn sanitize(body: &Value) -> UpstreamPayload {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| messages.iter().filter_map(sanitize_message).collect())
        .unwrap_or_default();

    UpstreamPayload {
        model,
        messages,
        temperature: sanitize_temperature(body.get("temperature")),
        max_tokens: sanitize_max_tokens(body.get("max_tokens").or_else(|| body.get("maxTokens"))),
        stream: None,
    }
}

fn sanitize_message(message: &Value) -> Option<UpstreamMessage> {
    let role = message.get("role").and_then(Value::as_str).and_then(Role::parse)?;
    let content = match message.get("content")? {
        Value::String(text) => UpstreamContent::Text(text.clone()),
        Value::Array(parts) => {
            UpstreamContent::Parts(parts.iter().filter_map(sanitize_part).collect())
        }
        _ => return None,
    };
    Some(UpstreamMessage { role, content })
}

fn sanitize_part(part: &Value) -> Option<ContentPart> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentPart::Text {
            text: part.get("text").and_then(Value::as_str)?.to_string(),
        }),
        "image_url" => Some(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: part.pointer("/image_url/url").and_then(Value::as_str)?.to_string(),
            },
        }),
        _ => None,
    }
}

fn sanitize_temperature(value: Option<&Value>) -> f64 {
    value
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite())
        .map(|t| t.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE))
        .unwrap_or(DEFAULT_TEMPERATURE)
}

fn sanitize_max_tokens(value: Option<&Value>) -> u64 {
    match value.and_then(Value::as_f64) {
        Some(n) if n.is_finite() && n >= 1.0 => (n.trunc() as u64).min(MAX_TOKENS_CAP),
        _ => DEFAULT_MAX_TOKENS,
    }
}
