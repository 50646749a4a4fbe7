//! Audio transcription requests.
//!
//! Clients post base64 audio inside JSON; the provider wants a `multipart/form-data` upload.
//! This module decodes the former and encodes the latter.
use crate::upstream::{TRANSCRIPTIONS_PATH, UpstreamRequest};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use uuid::Uuid;

pub const TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_MIME_TYPE: &str = "audio/webm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Missing audio")]
    MissingAudio,
    #[error("Invalid audio encoding")]
    InvalidEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    pub audio: Vec<u8>,
    pub mime_type: String,
    pub language: Option<String>,
}

impl TranscriptionRequest {
    /// Parse `{audio, mimeType?, language?}`. `audio` may also be a `data:` URL, whose media
    /// type is used when `mimeType` is absent.
    pub fn from_json(body: &Value) -> Result<Self, TranscriptionError> {
        let audio = body
            .get("audio")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|audio| !audio.is_empty())
            .ok_or(TranscriptionError::MissingAudio)?;

        let (url_mime, encoded) = split_data_url(audio);
        let audio = STANDARD
            .decode(encoded)
            .map_err(|_| TranscriptionError::InvalidEncoding)?;
        if audio.is_empty() {
            return Err(TranscriptionError::MissingAudio);
        }

        let mime_type = body
            .get("mimeType")
            .and_then(Value::as_str)
            .filter(|mime| !mime.is_empty())
            .or(url_mime)
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        let language = body
            .get("language")
            .and_then(Value::as_str)
            .filter(|language| !language.is_empty())
            .map(str::to_string);

        Ok(Self {
            audio,
            mime_type,
            language,
        })
    }

    pub fn file_name(&self) -> String {
        format!("audio.{}", extension_for(&self.mime_type))
    }

    pub fn into_upstream_request(self) -> UpstreamRequest {
        let mut form = MultipartForm::new()
            .file("file", &self.file_name(), &self.mime_type, &self.audio)
            .text("model", TRANSCRIPTION_MODEL);
        if let Some(language) = &self.language {
            form = form.text("language", language);
        }
        let (content_type, body) = form.finish();
        UpstreamRequest::multipart(TRANSCRIPTIONS_PATH, content_type, body)
    }
}

fn split_data_url(audio: &str) -> (Option<&str>, &str) {
    let Some(rest) = audio.strip_prefix("data:") else {
        return (None, audio);
    };
    match rest.split_once(',') {
        Some((meta, data)) => {
            let mime = meta.split(';').next().filter(|mime| !mime.is_empty());
            (mime, data)
        }
        None => (None, audio),
    }
}

/// File extension the provider uses to sniff the container format.
fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/flac" | "audio/x-flac" => "flac",
        _ => "webm",
    }
}

/// Minimal `multipart/form-data` body builder.
#[derive(Debug)]
pub struct MultipartForm {
    boundary: String,
    body: BytesMut,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        Self {
            boundary: format!("chat-relay-{}", Uuid::new_v4().simple()),
            body: BytesMut::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("form-data; name=\"{name}\""), None);
        self.body.put_slice(value.as_bytes());
        self.body.put_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
        self.open_part(
            &format!("form-data; name=\"{name}\"; filename=\"{file_name}\""),
            Some(content_type),
        );
        self.body.put_slice(data);
        self.body.put_slice(b"\r\n");
        self
    }

    fn open_part(&mut self, disposition: &str, content_type: Option<&str>) {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"\r\nContent-Disposition: ");
        self.body.put_slice(disposition.as_bytes());
        if let Some(content_type) = content_type {
            self.body.put_slice(b"\r\nContent-Type: ");
            self.body.put_slice(content_type.as_bytes());
        }
        self.body.put_slice(b"\r\n\r\n");
    }

    /// Close the form, returning the `content-type` header value and the body.
    pub fn finish(mut self) -> (String, Bytes) {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"--\r\n");
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body.freeze(),
        )
    }
}
