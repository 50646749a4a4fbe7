//! Inbound chat request validation
//!
//! Requests are checked against a fixed policy before anything is sent upstream. The checks run
//! in a fixed order and the first failure wins, so a client always sees the same message for the
//! same bad request.
use serde_json::Value;

/// Models that may be requested through the relay.
pub const ALLOWED_MODELS: [&str; 6] = [
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o3-mini",
    "o4-mini",
];

/// Roles a message may carry.
pub const ALLOWED_ROLES: [&str; 3] = ["user", "assistant", "system"];

pub const MAX_MESSAGES: usize = 100;

/// Maximum length of a single text, counted in UTF-16 code units.
pub const MAX_TEXT_LEN: usize = 32_000;

/// Reasons a chat request is rejected. The display string is sent back to the client verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid body")]
    InvalidBody,
    #[error("Unknown model")]
    UnknownModel,
    #[error("No messages")]
    NoMessages,
    #[error("Too many messages")]
    TooManyMessages,
    #[error("Invalid role")]
    InvalidRole,
    #[error("Message too long")]
    MessageTooLong,
    #[error("Invalid content part")]
    InvalidContentPart,
    #[error("Content must be string or array")]
    InvalidContent,
}

pub fn is_allowed_model(model: &str) -> bool {
    ALLOWED_MODELS.contains(&model)
}

/// Text length as the browser client measures it.
pub(crate) fn text_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Validate a chat request body.
pub fn validate(body: &Value) -> Result<(), ValidationError> {
    let body = body.as_object().ok_or(ValidationError::InvalidBody)?;

    match body.get("model").and_then(Value::as_str) {
        Some(model) if is_allowed_model(model) => {}
        _ => return Err(ValidationError::UnknownModel),
    }

    let messages = match body.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => messages,
        _ => return Err(ValidationError::NoMessages),
    };
    if messages.len() > MAX_MESSAGES {
        return Err(ValidationError::TooManyMessages);
    }

    messages.iter().try_for_each(validate_message)
}

fn validate_message(message: &Value) -> Result<(), ValidationError> {
    let role = message.get("role").and_then(Value::as_str);
    if !role.is_some_and(|role| ALLOWED_ROLES.contains(&role)) {
        return Err(ValidationError::InvalidRole);
    }

    match message.get("content") {
        Some(Value::String(text)) => check_text(text),
        Some(Value::Array(parts)) => parts.iter().try_for_each(validate_part),
        _ => Err(ValidationError::InvalidContent),
    }
}

fn validate_part(part: &Value) -> Result<(), ValidationError> {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => match part.get("text") {
            Some(Value::String(text)) => check_text(text),
            _ => Err(ValidationError::InvalidContentPart),
        },
        Some("image_url") => match part.pointer("/image_url/url") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(ValidationError::InvalidContentPart),
        },
        _ => Err(ValidationError::InvalidContentPart),
    }
}

fn check_text(text: &str) -> Result<(), ValidationError> {
    if text_len(text) > MAX_TEXT_LEN {
        Err(ValidationError::MessageTooLong)
    } else {
        Ok(())
    }
}
