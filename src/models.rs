use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversational turn. The caller owns the surrounding history; the gateway only reads it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Ordered conversation; order is the prompt context.
pub type ChatHistory = [ChatMessage];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Primary,
    Secondary,
}

impl BackendId {
    pub const ALL: [BackendId; 2] = [BackendId::Primary, BackendId::Secondary];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendId::Primary => "primary",
            BackendId::Secondary => "secondary",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental piece of a streamed backend response. `delta` is absent when the upstream
/// chunk carried no text (finish markers, safety metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
}

impl BackendChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            finish_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Available,
    Degraded,
}

impl AvailabilityState {
    pub fn is_available(self) -> bool {
        self == AvailabilityState::Available
    }
}

/// Observability view of the tracker, in the vocabulary the front end renders.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub primary: &'static str,
    pub secondary: &'static str,
    pub active: &'static str,
}

impl StatusSnapshot {
    pub fn new(
        primary: AvailabilityState,
        secondary: AvailabilityState,
        active: Option<BackendId>,
    ) -> Self {
        Self {
            primary: if primary.is_available() {
                "available"
            } else {
                "limited"
            },
            secondary: if secondary.is_available() {
                "available"
            } else {
                "unavailable"
            },
            active: active.map(BackendId::as_str).unwrap_or("unavailable"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_owned());
        }
        if self
            .messages
            .iter()
            .all(|message| message.content.trim().is_empty())
        {
            return Err("messages must carry some content".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub backend: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeltaEvent<'a> {
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub struct DoneEvent {
    pub done: bool,
    pub backend: &'static str,
}
