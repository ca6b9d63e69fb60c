pub mod databricks;
pub mod gemini;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::{
    adapter::BackendPayload,
    models::{BackendChunk, BackendId},
};

pub type BackendStream = BoxStream<'static, Result<BackendChunk, BackendError>>;

/// Native response shape of a backend call. Each client states explicitly which one it produced.
pub enum RawResponse {
    Stream(BackendStream),
    Complete(String),
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawResponse::Stream(_) => f.write_str("RawResponse::Stream(..)"),
            RawResponse::Complete(text) => f.debug_tuple("RawResponse::Complete").field(text).finish(),
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> BackendId;
    fn name(&self) -> &str;
    async fn generate(&self, payload: BackendPayload) -> Result<RawResponse, BackendError>;
    /// Cheap reachability check; never carries conversation content.
    async fn probe(&self) -> Result<(), BackendError>;
}

/// The two fixed backends, addressed by priority slot.
#[derive(Clone)]
pub struct BackendPair {
    primary: Arc<dyn ChatBackend>,
    secondary: Arc<dyn ChatBackend>,
}

impl BackendPair {
    pub fn new(primary: Arc<dyn ChatBackend>, secondary: Arc<dyn ChatBackend>) -> Self {
        Self { primary, secondary }
    }

    pub fn get(&self, backend: BackendId) -> &Arc<dyn ChatBackend> {
        match backend {
            BackendId::Primary => &self.primary,
            BackendId::Secondary => &self.secondary,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend not configured: {0}")]
    Configuration(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::QuotaExceeded(_) => "quota_exceeded",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Timeout(_) => "timeout",
            BackendError::Configuration(_) => "configuration",
            BackendError::InvalidResponse(_) => "invalid_response",
        }
    }

    pub(crate) fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            BackendError::Timeout(error.to_string())
        } else {
            BackendError::Unavailable(error.to_string())
        }
    }
}

pub(crate) fn payload_mismatch(backend: BackendId, payload: &BackendPayload) -> BackendError {
    BackendError::Configuration(format!(
        "{backend} backend cannot send a {} payload",
        payload.target()
    ))
}
