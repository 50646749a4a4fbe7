//! Byte-transparent relay of an upstream event stream to the downstream client.
//!
//! [`RelayStream`] owns the upstream body for the lifetime of the request and is itself the
//! downstream response body. It forwards every chunk exactly as received and in order; it never
//! parses, buffers or re-frames the SSE events passing through it.
//!
//! ## Lifecycle
//!
//! `Open -> Streaming -> {Done | Aborted | Errored}`
//!
//! - `Done`: upstream reached end of stream.
//! - `Aborted`: the cancellation token fired, or the downstream body was dropped because the
//!   client disconnected.
//! - `Errored`: upstream failed mid-stream. Headers are already on the wire at that point, so
//!   the failure is logged and the connection is cut instead of reporting a JSON error.
//!
//! Every terminal transition goes through [`RelayStream::finish`], which releases the upstream
//! stream exactly once, whichever exit got there first.
use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Streaming,
    Done,
    Aborted,
    Errored,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayState::Done | RelayState::Aborted | RelayState::Errored
        )
    }
}

pub struct RelayStream<S> {
    upstream: Option<S>,
    state: RelayState,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    on_finish: Option<oneshot::Sender<RelayState>>,
    chunks: u64,
    bytes: u64,
}

impl<S> RelayStream<S> {
    pub fn new(upstream: S, cancel: CancellationToken) -> Self {
        Self {
            upstream: Some(upstream),
            state: RelayState::Open,
            cancelled: Box::pin(cancel.cancelled_owned()),
            on_finish: None,
            chunks: 0,
            bytes: 0,
        }
    }

    /// Notify `tx` with the terminal state once the relay finishes.
    pub fn on_finish(mut self, tx: oneshot::Sender<RelayState>) -> Self {
        self.on_finish = Some(tx);
        self
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn finish(&mut self, outcome: RelayState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = outcome;
        // Dropping the upstream body closes its connection.
        drop(self.upstream.take());

        match outcome {
            RelayState::Done => debug!(
                chunks = self.chunks,
                bytes = self.bytes,
                "Upstream stream completed"
            ),
            RelayState::Aborted => info!(
                chunks = self.chunks,
                bytes = self.bytes,
                "Relay cancelled, upstream released"
            ),
            _ => {}
        }

        if let Some(tx) = self.on_finish.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.state.is_terminal() {
            return Poll::Ready(None);
        }

        // Checked before every upstream read so nothing more is requested once cancelled.
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.finish(RelayState::Aborted);
            return Poll::Ready(None);
        }

        let Some(upstream) = this.upstream.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(upstream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.state = RelayState::Streaming;
                this.chunks += 1;
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                error!(
                    chunks = this.chunks,
                    bytes = this.bytes,
                    "Upstream stream failed after headers were sent: {}",
                    e
                );
                this.finish(RelayState::Errored);
                Poll::Ready(Some(Err(std::io::Error::other(
                    "upstream stream terminated unexpectedly",
                ))))
            }
            Poll::Ready(None) => {
                this.finish(RelayState::Done);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for RelayStream<S> {
    fn drop(&mut self) {
        self.finish(RelayState::Aborted);
    }
}

/// Turn a successful upstream response into a downstream event-stream response.
///
/// The headers are fixed here, before any body byte exists. Callers must settle upstream
/// errors into a JSON response before calling this.
pub fn relay(upstream: Response, cancel: CancellationToken) -> Response {
    let stream = RelayStream::new(upstream.into_body().into_data_stream(), cancel);
    event_stream_response(Body::from_stream(stream))
}

pub fn event_stream_response(body: Body) -> Response {
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
