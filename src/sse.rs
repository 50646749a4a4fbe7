//! Consumer side of a relayed completion stream.
//!
//! [`CompletionDeltas`] turns the raw bytes of an OpenAI-style event stream into the text
//! increments it carries. It is lazy (nothing is read until polled), finite (it ends at
//! `data: [DONE]` or end of input), and cancelled by dropping it. An error from the underlying
//! stream is yielded once and ends the sequence, so completion and failure never both happen.
//!
//! Unlike the relay, this side does care about framing: network chunks can split a line
//! anywhere, so bytes are buffered until a full line is available.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const DONE_SENTINEL: &str = "[DONE]";

pub struct CompletionDeltas<S> {
    inner: Option<S>,
    buffer: BytesMut,
    pending: VecDeque<String>,
}

impl<S> CompletionDeltas<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Some(inner),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
        }
    }

    fn close(&mut self) {
        self.inner = None;
        self.buffer.clear();
    }

    /// Returns false once the terminal sentinel has been seen.
    fn handle_line(&mut self, line: &[u8]) -> bool {
        match parse_line(line) {
            Line::Delta(delta) => self.pending.push_back(delta),
            Line::Done => return false,
            Line::Skip => {}
        }
        true
    }
}

impl CompletionDeltas<axum::body::BodyDataStream> {
    pub fn from_body(body: axum::body::Body) -> Self {
        Self::new(body.into_data_stream())
    }
}

impl<S, E> Stream for CompletionDeltas<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(delta) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }

            if this.inner.is_none() {
                return Poll::Ready(None);
            }

            if let Some(pos) = this.buffer.iter().position(|b| *b == b'\n') {
                let line = this.buffer.split_to(pos + 1);
                if !this.handle_line(&line) {
                    this.close();
                }
                continue;
            }

            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match Pin::new(inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    this.close();
                    this.pending.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    // A last line without a trailing newline still counts.
                    let rest = this.buffer.split();
                    if !rest.is_empty() {
                        this.handle_line(&rest);
                    }
                    this.close();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Delta(String),
    Done,
    Skip,
}

fn parse_line(line: &[u8]) -> Line {
    let Ok(line) = std::str::from_utf8(line) else {
        return Line::Skip;
    };
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Line::Skip;
    };
    let data = data.trim_start();
    if data == DONE_SENTINEL {
        return Line::Done;
    }

    // Malformed frames are skipped rather than ending the stream.
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return Line::Skip;
    };
    match event.pointer("/choices/0/delta/content").and_then(Value::as_str) {
        Some(content) if !content.is_empty() => Line::Delta(content.to_string()),
        _ => Line::Skip,
    }
}
