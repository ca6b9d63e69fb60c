use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    adapter::BackendPayload,
    backend::{payload_mismatch, BackendError, ChatBackend, RawResponse},
    models::BackendId,
};

#[derive(Debug, Clone)]
pub struct DatabricksSettings {
    pub endpoint_url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub probe_timeout: Duration,
}

impl DatabricksSettings {
    pub fn from_env() -> Self {
        Self {
            endpoint_url: non_empty_var("DATABRICKS_ENDPOINT_URL"),
            token: non_empty_var("DATABRICKS_TOKEN"),
            timeout: Duration::from_secs(read_secs("DATABRICKS_TIMEOUT_SECS", 90)),
            probe_timeout: Duration::from_secs(read_secs("DATABRICKS_PROBE_TIMEOUT_SECS", 10)),
        }
    }
}

/// Secondary backend: a batch-only serving endpoint speaking the chat-completions body shape.
#[derive(Clone)]
pub struct DatabricksBackend {
    client: reqwest::Client,
    endpoint_url: Option<String>,
    token: Option<String>,
    probe_timeout: Duration,
}

impl DatabricksBackend {
    pub fn new(settings: DatabricksSettings) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|error| format!("failed to build Databricks HTTP client: {error}"))?;

        Ok(Self {
            client,
            endpoint_url: settings.endpoint_url,
            token: settings.token,
            probe_timeout: settings.probe_timeout,
        })
    }

    pub fn from_env() -> Result<Self, String> {
        Self::new(DatabricksSettings::from_env())
    }

    fn credentials(&self) -> Result<(&str, &str), BackendError> {
        match (self.endpoint_url.as_deref(), self.token.as_deref()) {
            (Some(endpoint), Some(token)) => Ok((endpoint, token)),
            _ => Err(BackendError::Configuration(
                "DATABRICKS_ENDPOINT_URL and DATABRICKS_TOKEN must both be set".to_owned(),
            )),
        }
    }
}

#[async_trait]
impl ChatBackend for DatabricksBackend {
    fn id(&self) -> BackendId {
        BackendId::Secondary
    }

    fn name(&self) -> &str {
        "databricks"
    }

    async fn generate(&self, payload: BackendPayload) -> Result<RawResponse, BackendError> {
        let BackendPayload::Databricks(request) = &payload else {
            return Err(payload_mismatch(self.id(), &payload));
        };
        let (endpoint, token) = self.credentials()?;

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(BackendError::from_transport)?;

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

        let parsed: DatabricksResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        let choice = parsed
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackendError::InvalidResponse("missing choices in response".to_owned())
            })?;
        let content = choice.message.content.ok_or_else(|| {
            BackendError::InvalidResponse("choice carries no message content".to_owned())
        })?;

        debug!(backend = self.name(), chars = content.len(), "completion received");
        Ok(RawResponse::Complete(content))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let (endpoint, token) = self.credentials()?;
        let response = self
            .client
            .request(Method::OPTIONS, endpoint)
            .bearer_auth(token)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(BackendError::Unavailable(format!(
                "health check returned status {}",
                status.as_u16()
            ))),
        }
    }
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(format!("rate limited: {trimmed}"))
        }
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

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn read_secs(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct DatabricksResponse {
    #[serde(default)]
    choices: Option<Vec<DatabricksChoice>>,
}

#[derive(Debug, Deserialize)]
struct DatabricksChoice {
    message: DatabricksMessageBody,
}

#[derive(Debug, Deserialize)]
struct DatabricksMessageBody {
    #[serde(default)]
    content: Option<String>,
}
