use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    adapter::BackendPayload,
    backend::{BackendError, ChatBackend, RawResponse},
    models::{BackendChunk, BackendId},
};

#[derive(Debug, Clone)]
pub enum MockReply {
    Stream(Vec<String>),
    Complete(String),
    /// Streams the given chunks, then breaks with a transient error.
    Interrupted(Vec<String>),
    QuotaExceeded,
    Unavailable,
    Malformed,
    /// Never answers; exercises call timeouts.
    Hang,
}

/// Scripted backend that records every call it receives.
#[derive(Debug)]
pub struct MockBackend {
    id: BackendId,
    name: String,
    reply: Mutex<MockReply>,
    probe_healthy: AtomicBool,
    token_delay: Duration,
    calls: AtomicUsize,
    probes: AtomicUsize,
    last_payload: Mutex<Option<BackendPayload>>,
}

impl MockBackend {
    pub fn new(id: BackendId, reply: MockReply) -> Self {
        Self {
            id,
            name: format!("mock-{id}"),
            reply: Mutex::new(reply),
            probe_healthy: AtomicBool::new(true),
            token_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            last_payload: Mutex::new(None),
        }
    }

    /// Streams the reply word by word, the way a token-streaming backend would.
    pub fn streaming(id: BackendId, text: &str) -> Self {
        Self::new(id, MockReply::Stream(split_for_stream(text)))
    }

    pub fn complete(id: BackendId, text: &str) -> Self {
        Self::new(id, MockReply::Complete(text.to_owned()))
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_probe_healthy(self, healthy: bool) -> Self {
        self.probe_healthy.store(healthy, Ordering::SeqCst);
        self
    }

    pub fn set_reply(&self, reply: MockReply) {
        *self.reply.lock().unwrap_or_else(PoisonError::into_inner) = reply;
    }

    pub fn set_probe_healthy(&self, healthy: bool) {
        self.probe_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<BackendPayload> {
        self.last_payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stream_reply(&self, chunks: Vec<String>, failure: Option<BackendError>) -> RawResponse {
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(BackendChunk::text(chunk))).await.is_err() {
                    return;
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            let last = match failure {
                Some(error) => Err(error),
                None => Ok(BackendChunk {
                    delta: None,
                    finish_reason: Some("stop".to_owned()),
                }),
            };
            let _ = tx.send(last).await;
        });

        debug!(backend = %self.name, "stream prepared");
        RawResponse::Stream(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, payload: BackendPayload) -> Result<RawResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(payload);

        let reply = self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match reply {
            MockReply::Stream(chunks) => Ok(self.stream_reply(chunks, None)),
            MockReply::Complete(text) => Ok(RawResponse::Complete(text)),
            MockReply::Interrupted(chunks) => Ok(self.stream_reply(
                chunks,
                Some(BackendError::Unavailable("connection reset".to_owned())),
            )),
            MockReply::QuotaExceeded => Err(BackendError::QuotaExceeded(format!(
                "{} quota exhausted",
                self.name
            ))),
            MockReply::Unavailable => Err(BackendError::Unavailable(format!(
                "{} unreachable",
                self.name
            ))),
            MockReply::Malformed => Err(BackendError::InvalidResponse(
                "missing choices in response".to_owned(),
            )),
            MockReply::Hang => {
                std::future::pending::<()>().await;
                Err(BackendError::Timeout("unreachable".to_owned()))
            }
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "{} probe failed",
                self.name
            )))
        }
    }
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
