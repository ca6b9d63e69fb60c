use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use tracing::{debug, warn};

use crate::{
    availability::AvailabilityTracker,
    backend::{BackendError, RawResponse},
    metrics::AppMetrics,
    models::{BackendChunk, BackendId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Delta(String),
    /// Terminal marker carrying every delta concatenated, ready to be appended to history.
    Done(String),
}

/// Backend-agnostic, lazy sequence of text deltas.
///
/// Dropping it mid-way releases the upstream connection; nothing already yielded is retracted.
pub struct NormalizedResponse {
    served_by: Option<BackendId>,
    events: BoxStream<'static, ResponseEvent>,
}

impl std::fmt::Debug for NormalizedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizedResponse")
            .field("served_by", &self.served_by)
            .finish_non_exhaustive()
    }
}

impl NormalizedResponse {
    /// A canned reply that no backend produced, such as the advisory sent when nothing is reachable.
    pub fn fixed(message: impl Into<String>) -> Self {
        Self {
            served_by: None,
            events: single_delta(message.into()),
        }
    }

    pub fn served_by(&self) -> Option<BackendId> {
        self.served_by
    }

    pub async fn collect_text(mut self) -> String {
        let mut accumulated = String::new();
        while let Some(event) = self.events.next().await {
            match event {
                ResponseEvent::Delta(delta) => accumulated.push_str(&delta),
                ResponseEvent::Done(full) => return full,
            }
        }
        accumulated
    }
}

impl Stream for NormalizedResponse {
    type Item = ResponseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

pub fn normalize(raw: RawResponse) -> NormalizedResponse {
    NormalizedResponse {
        served_by: None,
        events: events(raw, None),
    }
}

/// Like [`normalize`], but a stream that breaks mid-way demotes the backend that produced it
/// and counts the error against it.
pub(crate) fn normalize_observed(
    raw: RawResponse,
    backend: BackendId,
    tracker: Arc<AvailabilityTracker>,
    metrics: Arc<AppMetrics>,
) -> NormalizedResponse {
    let observer = StreamObserver {
        backend,
        tracker,
        metrics,
    };
    NormalizedResponse {
        served_by: Some(backend),
        events: events(raw, Some(observer)),
    }
}

struct StreamObserver {
    backend: BackendId,
    tracker: Arc<AvailabilityTracker>,
    metrics: Arc<AppMetrics>,
}

impl StreamObserver {
    fn interrupted(&self, error: &BackendError) {
        self.metrics.observe_backend_error(self.backend, error.kind());
        self.tracker.mark_degraded(self.backend);
    }
}

fn events(raw: RawResponse, observer: Option<StreamObserver>) -> BoxStream<'static, ResponseEvent> {
    match raw {
        RawResponse::Complete(text) => single_delta(text),
        RawResponse::Stream(mut upstream) => {
            let stream = async_stream::stream! {
                let mut accumulated = String::new();
                let mut deltas = 0usize;
                let mut finish_reason = None;

                while let Some(next) = upstream.next().await {
                    match next {
                        Ok(BackendChunk { delta, finish_reason: reason }) => {
                            if reason.is_some() {
                                finish_reason = reason;
                            }
                            let Some(delta) = delta.filter(|value| !value.is_empty()) else {
                                continue;
                            };
                            accumulated.push_str(&delta);
                            deltas += 1;
                            yield ResponseEvent::Delta(delta);
                        }
                        Err(error) => {
                            warn!(error = %error, deltas, "backend stream interrupted");
                            if let Some(observer) = &observer {
                                observer.interrupted(&error);
                            }
                            break;
                        }
                    }
                }

                debug!(
                    deltas,
                    chars = accumulated.len(),
                    finish_reason = finish_reason.as_deref().unwrap_or("none"),
                    "stream normalized"
                );
                yield ResponseEvent::Done(accumulated);
            };
            stream.boxed()
        }
    }
}

/// An empty body carries no text, so it yields only the terminal marker.
fn single_delta(text: String) -> BoxStream<'static, ResponseEvent> {
    if text.is_empty() {
        return stream::iter([ResponseEvent::Done(text)]).boxed();
    }
    stream::iter([ResponseEvent::Delta(text.clone()), ResponseEvent::Done(text)]).boxed()
}

/// Pulls a streamed response up to its first text-bearing chunk so that an upstream that fails
/// before producing any text is reported as a call error rather than an empty reply.
pub(crate) async fn prime(raw: RawResponse) -> Result<RawResponse, BackendError> {
    let mut upstream = match raw {
        RawResponse::Stream(upstream) => upstream,
        complete @ RawResponse::Complete(_) => return Ok(complete),
    };

    let mut held = Vec::new();
    let mut exhausted = true;
    while let Some(next) = upstream.next().await {
        let chunk = next?;
        let has_text = chunk.delta.as_deref().is_some_and(|value| !value.is_empty());
        held.push(Ok(chunk));
        if has_text {
            exhausted = false;
            break;
        }
    }

    let replay = stream::iter(held);
    if exhausted {
        Ok(RawResponse::Stream(replay.boxed()))
    } else {
        Ok(RawResponse::Stream(replay.chain(upstream).boxed()))
    }
}
