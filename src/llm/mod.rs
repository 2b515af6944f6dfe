//! Chat-model provider surface.
//!
//! The core talks to an OpenAI-compatible chat API. [`ChatProvider`] is the
//! seam: production uses [`HttpChatClient`], tests use scripted providers.

pub mod client;
pub mod retry;
pub mod stream;

pub use client::HttpChatClient;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{RagError, Result};

/// Message author role on the chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    /// Request `{"type": "json_object"}` structured output.
    pub json_mode: bool,
    /// Per-request deadline.
    pub deadline: Duration,
}

impl ChatRequest {
    /// Default deadline for a single chat call.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: 0.3,
            json_mode: false,
            deadline: Self::DEFAULT_DEADLINE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Streamed text deltas from a chat completion.
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// Seam to the external chat model.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run a completion and return the full text.
    async fn complete(&self, request: ChatRequest) -> Result<String>;

    /// Run a streaming completion, yielding text deltas as they arrive.
    async fn complete_stream(&self, request: ChatRequest) -> Result<DeltaStream>;
}

/// Parse a JSON-mode completion into `T`. Tolerates markdown code fences
/// some models wrap around their output. Schema mismatches are permanent
/// failures; callers fall back rather than retry.
pub fn parse_json_payload<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    serde_json::from_str(body).map_err(|e| RagError::SchemaViolation(e.to_string()))
}
