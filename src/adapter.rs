//! Conversion of caller-neutral history into each backend's request body.
//!
//! Both payloads carry exactly one injected system instruction when the caller supplied none.
//! The primary keeps system turns out of `contents` and sends them through `systemInstruction`;
//! the secondary keeps them inline as `system` messages.

use std::env;

use serde::Serialize;

use crate::models::{BackendId, ChatHistory, ChatMessage, Role};

pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful coding assistant. Provide clear, concise, and correct code and explanations.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BackendPayload {
    Gemini(GeminiRequest),
    Databricks(DatabricksRequest),
}

impl BackendPayload {
    pub fn target(&self) -> BackendId {
        match self {
            BackendPayload::Gemini(_) => BackendId::Primary,
            BackendPayload::Databricks(_) => BackendId::Secondary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    pub contents: Vec<GeminiContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeminiPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabricksRequest {
    pub messages: Vec<DatabricksMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabricksMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

impl GenerationParams {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let temperature = env::var("DATABRICKS_TEMPERATURE")
            .ok()
            .and_then(|value| value.parse::<f32>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
            .unwrap_or(defaults.temperature);
        let max_tokens = env::var("DATABRICKS_MAX_TOKENS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_tokens);

        Self {
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryAdapter {
    system_instruction: String,
    generation: GenerationParams,
}

impl Default for HistoryAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION, GenerationParams::default())
    }
}

impl HistoryAdapter {
    pub fn new(system_instruction: impl Into<String>, generation: GenerationParams) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            generation,
        }
    }

    pub fn from_env() -> Self {
        let system_instruction = env::var("ASSISTANT_SYSTEM_PROMPT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_owned());
        Self::new(system_instruction, GenerationParams::from_env())
    }

    pub fn adapt(&self, history: &ChatHistory, backend: BackendId) -> BackendPayload {
        match backend {
            BackendId::Primary => BackendPayload::Gemini(self.gemini(history)),
            BackendId::Secondary => BackendPayload::Databricks(self.databricks(history)),
        }
    }

    fn gemini(&self, history: &ChatHistory) -> GeminiRequest {
        let mut system_parts = Vec::new();
        let mut contents = Vec::with_capacity(history.len());

        for message in history {
            let part = GeminiPart {
                text: message.content.clone(),
            };
            match message.role {
                Role::System => system_parts.push(part),
                Role::User => contents.push(GeminiContent {
                    role: Some("user"),
                    parts: vec![part],
                }),
                Role::Assistant => contents.push(GeminiContent {
                    role: Some("model"),
                    parts: vec![part],
                }),
            }
        }

        if system_parts.is_empty() {
            system_parts.push(GeminiPart {
                text: self.system_instruction.clone(),
            });
        }

        GeminiRequest {
            system_instruction: Some(GeminiContent {
                role: None,
                parts: system_parts,
            }),
            contents,
        }
    }

    fn databricks(&self, history: &ChatHistory) -> DatabricksRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !has_system_turn(history) {
            messages.push(DatabricksMessage {
                role: "system",
                content: self.system_instruction.clone(),
            });
        }
        messages.extend(history.iter().map(databricks_message));

        DatabricksRequest {
            messages,
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
        }
    }
}

fn has_system_turn(history: &ChatHistory) -> bool {
    history.iter().any(|message| message.role == Role::System)
}

fn databricks_message(message: &ChatMessage) -> DatabricksMessage {
    DatabricksMessage {
        role: match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        },
        content: message.content.clone(),
    }
}
