// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The provider-facing completion contract, including the tool-call
//! surface the self-healing coordinator drives (`searchDocumentation` /
//! `submit`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A tool the model may call instead of (or alongside) returning text,
/// described the way OpenAI/Anthropic/Gemini function-calling expects:
/// a name, a human description, and a JSON Schema for its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One tool invocation the model chose to make.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single request to a completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Tools the model may call. Empty means plain text completion.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The provider's response: either free text, one or more tool calls, or
/// both (some providers emit a text preamble alongside a tool call).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub tokens_used: Option<u32>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionResponse {
    pub fn has_tool_call(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Errors a provider implementation can surface.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    HttpError(String),
    #[error("authentication error: {0}")]
    AuthError(String),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to (de)serialize provider payload: {0}")]
    SerializationError(String),
    #[error("provider-specific error: {0}")]
    ProviderSpecific(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::SerializationError(err.to_string())
    }
}

/// A chat-completion-capable LLM backend.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Short identifier used in logs and metrics (`"openai"`, `"anthropic"`, `"gemini"`).
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), ProviderError>;
}
