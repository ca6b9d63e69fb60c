use std::{env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::{
    adapter::{BackendPayload, GeminiRequest},
    backend::{payload_mismatch, BackendError, ChatBackend, RawResponse},
    models::{BackendChunk, BackendId},
};

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub stream: bool,
    pub timeout: Duration,
}

impl GeminiSettings {
    pub fn from_env() -> Self {
        let api_key = env::var("GOOGLE_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let base_url = env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_owned());
        let model = env::var("GEMINI_MODEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "gemini-1.5-flash".to_owned());
        let stream = env::var("GEMINI_STREAM")
            .ok()
            .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        let timeout_secs = env::var("GEMINI_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);

        Self {
            api_key,
            base_url,
            model,
            stream,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Primary backend: Gemini `generateContent`, streamed over SSE when `stream` is set.
#[derive(Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    stream: bool,
}

impl GeminiBackend {
    pub fn new(settings: GeminiSettings) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|error| format!("failed to build Gemini HTTP client: {error}"))?;

        Ok(Self {
            client,
            api_key: settings.api_key,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            model: settings.model.trim_start_matches("models/").to_owned(),
            stream: settings.stream,
        })
    }

    pub fn from_env() -> Result<Self, String> {
        Self::new(GeminiSettings::from_env())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| BackendError::Configuration("GOOGLE_API_KEY is not set".to_owned()))
    }

    async fn post(
        &self,
        method: &str,
        request: &GeminiRequest,
        sse: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let api_key = self.api_key()?;
        let mut builder = self
            .client
            .post(self.url(&format!("/v1beta/models/{}:{method}", self.model)))
            .header("x-goog-api-key", api_key)
            .json(request);
        if sse {
            builder = builder.query(&[("alt", "sse")]);
        }

        let response = builder.send().await.map_err(BackendError::from_transport)?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(map_http_error(
                status,
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }
        Ok(response)
    }

    async fn complete(&self, request: &GeminiRequest) -> Result<RawResponse, BackendError> {
        let response = self.post("generateContent", request, false).await?;
        let mut parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        if let Some(error) = parsed.error.take() {
            return Err(error.into_backend_error());
        }
        if parsed.candidates.is_empty() {
            return Err(BackendError::InvalidResponse(
                "missing candidates in response".to_owned(),
            ));
        }

        let chunk = parsed.into_chunk();
        Ok(RawResponse::Complete(chunk.delta.unwrap_or_default()))
    }

    async fn stream(&self, request: &GeminiRequest) -> Result<RawResponse, BackendError> {
        let response = self.post("streamGenerateContent", request, true).await?;
        let mut upstream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = SseLines::default();

            while let Some(next) = upstream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(BackendError::from_transport(error));
                        break;
                    }
                };

                for item in lines.push(&bytes) {
                    yield item;
                }
            }

            if let Some(item) = lines.finish() {
                yield item;
            }
        };

        debug!(backend = self.name(), model = %self.model, "stream prepared");
        Ok(RawResponse::Stream(stream.boxed()))
    }
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn id(&self) -> BackendId {
        BackendId::Primary
    }

    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, payload: BackendPayload) -> Result<RawResponse, BackendError> {
        let BackendPayload::Gemini(request) = &payload else {
            return Err(payload_mismatch(self.id(), &payload));
        };

        if self.stream {
            self.stream(request).await
        } else {
            self.complete(request).await
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .get(self.url("/v1beta/models"))
            .header("x-goog-api-key", api_key)
            .query(&[("pageSize", "1")])
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        Err(map_http_error(status, response.text().await.unwrap_or_default()))
    }
}

/// Reassembles SSE lines from network reads. Lines are split on raw bytes: a character may span
/// two reads.
#[derive(Debug, Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<BackendChunk, BackendError>> {
        self.buffer.extend_from_slice(bytes);

        let mut items = Vec::new();
        while let Some(index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=index).collect::<Vec<_>>();
            if let Some(item) = decode_line(&line) {
                items.push(item);
            }
        }
        items
    }

    /// Flushes a final line that arrived without a trailing newline.
    fn finish(self) -> Option<Result<BackendChunk, BackendError>> {
        decode_line(&self.buffer)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<BackendChunk, BackendError>> {
    match std::str::from_utf8(line) {
        Ok(line) => parse_sse_line(line.trim()),
        Err(error) => Some(Err(BackendError::InvalidResponse(error.to_string()))),
    }
}

fn parse_sse_line(line: &str) -> Option<Result<BackendChunk, BackendError>> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let mut parsed: GeminiResponse = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(error) => return Some(Err(BackendError::InvalidResponse(error.to_string()))),
    };
    if let Some(error) = parsed.error.take() {
        return Some(Err(error.into_backend_error()));
    }
    Some(Ok(parsed.into_chunk()))
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        return BackendError::QuotaExceeded(trimmed);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Configuration(format!("credential rejected: {trimmed}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        status if status.is_server_error() => {
            BackendError::Unavailable(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    error: Option<GeminiApiError>,
}

impl GeminiResponse {
    fn into_chunk(self) -> BackendChunk {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return BackendChunk {
                delta: None,
                finish_reason: None,
            };
        };

        let texts = candidate
            .content
            .map(|content| content.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<Vec<_>>();
        BackendChunk {
            delta: (!texts.is_empty()).then(|| texts.concat()),
            finish_reason: candidate.finish_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentBody>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentBody {
    #[serde(default)]
    parts: Vec<GeminiPartBody>,
}

#[derive(Debug, Deserialize)]
struct GeminiPartBody {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiApiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl GeminiApiError {
    fn into_backend_error(self) -> BackendError {
        let message = self.message.unwrap_or_else(|| "unknown error".to_owned());
        if self.code == Some(429) || self.status.as_deref() == Some("RESOURCE_EXHAUSTED") {
            BackendError::QuotaExceeded(message)
        } else {
            BackendError::Unavailable(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use super::*;
    use crate::{
        adapter::HistoryAdapter,
        models::ChatMessage,
        normalize::{normalize, ResponseEvent},
    };

    fn settings(base_url: String, stream: bool) -> GeminiSettings {
        GeminiSettings {
            api_key: Some("test-key".to_owned()),
            base_url,
            model: "gemini-test".to_owned(),
            stream,
            timeout: Duration::from_secs(5),
        }
    }

    fn payload() -> BackendPayload {
        HistoryAdapter::default().adapt(&[ChatMessage::user("hi")], BackendId::Primary)
    }

    #[tokio::test]
    async fn streams_text_from_sse_chunks() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}],\"role\":\"model\"}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo!\"}],\"role\":\"model\"},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let mock = server
            .mock("POST", "/v1beta/models/gemini-test:streamGenerateContent")
            .match_query(Matcher::UrlEncoded("alt".into(), "sse".into()))
            .match_header("x-goog-api-key", "test-key")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let backend = GeminiBackend::new(settings(server.url(), true)).expect("client");
        let raw = backend.generate(payload()).await.expect("stream should open");
        assert!(matches!(raw, RawResponse::Stream(_)));

        assert_eq!(normalize(raw).collect_text().await, "Hello!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn quota_status_maps_to_quota_exceeded() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-test:streamGenerateContent")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_body(r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#)
            .create_async()
            .await;

        let backend = GeminiBackend::new(settings(server.url(), true)).expect("client");
        let error = backend
            .generate(payload())
            .await
            .expect_err("quota should fail the call");

        assert_eq!(error.kind(), "quota_exceeded");
    }

    #[tokio::test]
    async fn non_streaming_mode_returns_complete_text() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"Hello"},{"text":"!"}]}}]}"#)
            .create_async()
            .await;

        let backend = GeminiBackend::new(settings(server.url(), false)).expect("client");
        let raw = backend.generate(payload()).await.expect("call should succeed");

        match raw {
            RawResponse::Complete(text) => assert_eq!(text, "Hello!"),
            other => panic!("expected complete response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_lists_models() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1beta/models")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"models":[]}"#)
            .create_async()
            .await;

        let backend = GeminiBackend::new(settings(server.url(), true)).expect("client");

        backend.probe().await.expect("probe should pass");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let mut config = settings("http://127.0.0.1:9".to_owned(), true);
        config.api_key = None;
        let backend = GeminiBackend::new(config).expect("client");

        let error = backend.probe().await.expect_err("probe should fail");
        assert_eq!(error.kind(), "configuration");
    }

    #[tokio::test]
    async fn rejects_payload_built_for_the_secondary() {
        let backend =
            GeminiBackend::new(settings("http://127.0.0.1:9".to_owned(), true)).expect("client");
        let payload =
            HistoryAdapter::default().adapt(&[ChatMessage::user("hi")], BackendId::Secondary);

        let error = backend
            .generate(payload)
            .await
            .expect_err("mismatched payload should fail");
        assert_eq!(error.kind(), "configuration");
    }

    #[tokio::test]
    async fn candidate_without_text_yields_no_delta() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-test:generateContent")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#)
            .create_async()
            .await;

        let backend = GeminiBackend::new(settings(server.url(), false)).expect("client");
        let raw = backend.generate(payload()).await.expect("call should succeed");
        let events = normalize(raw).collect::<Vec<_>>().await;

        assert_eq!(events, vec![ResponseEvent::Done(String::new())]);
    }

    #[test]
    fn line_split_across_reads_is_reassembled() {
        let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"caf\u{e9}\"}]}}]}\n\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').expect("accented char") + 1;
        let mut lines = SseLines::default();

        assert!(lines.push(&bytes[..split]).is_empty());
        let items = lines.push(&bytes[split..]);

        assert_eq!(items.len(), 1);
        match &items[0] {
            Ok(chunk) => assert_eq!(chunk.delta.as_deref(), Some("caf\u{e9}")),
            Err(error) => panic!("line should parse, got {error}"),
        }
        assert!(lines.finish().is_none());
    }

    #[test]
    fn trailing_invalid_utf8_is_reported() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"candidates\":[]}\xC3").is_empty());

        assert!(matches!(
            lines.finish(),
            Some(Err(BackendError::InvalidResponse(_)))
        ));
    }

    #[test]
    fn in_band_stream_errors_are_surfaced() {
        let item = parse_sse_line(r#"data: {"error":{"code":429,"message":"quota"}}"#)
            .expect("data line should parse");

        assert!(matches!(item, Err(BackendError::QuotaExceeded(_))));
        assert!(parse_sse_line(": keep-alive").is_none());
    }
}
