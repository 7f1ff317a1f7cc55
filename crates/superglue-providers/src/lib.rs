// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM provider integrations driving the self-healing coordinator.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod traits;

// Re-exports
pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
pub use traits::{
    CompletionRequest, CompletionResponse, LLMProvider, ProviderError, ToolCallRequest, ToolDefinition,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Constructs a provider by name (`"openai"`, `"anthropic"`, `"gemini"`),
/// reading its API key from the provider's standard environment variable.
pub fn provider_from_env(name: &str) -> Result<Box<dyn LLMProvider>, ProviderError> {
    match name.to_lowercase().as_str() {
        "openai" => Ok(Box::new(OpenAIProvider::from_env()?)),
        "anthropic" => Ok(Box::new(AnthropicProvider::from_env()?)),
        "gemini" => Ok(Box::new(GeminiProvider::from_env()?)),
        other => Err(ProviderError::InvalidRequest(format!("unknown LLM provider: {other}"))),
    }
}
