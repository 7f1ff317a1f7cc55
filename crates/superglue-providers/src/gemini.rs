// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Google Gemini provider implementation.

use crate::traits::{
    CompletionRequest, CompletionResponse, LLMProvider, ProviderError, ToolCallRequest, ToolDefinition,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Google Gemini API provider.
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxOutputTokens")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    status: String,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://generativelanguage.googleapis.com/v1beta".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url,
        }
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ProviderError::InvalidRequest("GEMINI_API_KEY environment variable not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_status() {
            match err.status() {
                Some(status) if status == 401 || status == 403 => ProviderError::AuthError(err.to_string()),
                Some(status) if status == 429 => ProviderError::RateLimitExceeded,
                _ => ProviderError::HttpError(err.to_string()),
            }
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    fn to_gemini_request(&self, request: &CompletionRequest) -> GenerateContentRequest {
        let contents = vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(request.prompt.clone()),
                function_call: None,
            }],
        }];

        let system_instruction = request.system.as_ref().map(|s| Content {
            role: None,
            parts: vec![Part {
                text: Some(s.clone()),
                function_call: None,
            }],
        });

        let generation_config = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            })
        } else {
            None
        };

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<GeminiErrorResponse>(body) {
            let error = error_response.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.status == "RESOURCE_EXHAUSTED" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return ProviderError::AuthError(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.status, error.message));
        }
        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let gemini_request = self.to_gemini_request(&request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&gemini_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)?;
        let candidate = parsed
            .candidates
            .first()
            .ok_or_else(|| ProviderError::SerializationError("no candidates in response".to_string()))?;

        let text = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let tool_calls: Vec<ToolCallRequest> = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.function_call.as_ref())
            .map(|fc| ToolCallRequest {
                name: fc.name.clone(),
                arguments: fc.args.clone(),
            })
            .collect();

        let mut metadata = std::collections::HashMap::new();
        if let Some(reason) = &candidate.finish_reason {
            metadata.insert("finish_reason".to_string(), serde_json::json!(reason));
        }

        Ok(CompletionResponse {
            text,
            model: request.model.clone(),
            tokens_used: parsed.usage_metadata.map(|u| u.total_token_count),
            tool_calls,
            metadata,
        })
    }

    fn name(&self) -> &str {
        "gemini"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let response = self.client.get(&url).send().await.map_err(Self::convert_reqwest_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::HttpError(format!(
                "Health check failed with status {}",
                response.status().as_u16()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = GeminiProvider::new("test-key".to_string());
        assert_eq!(provider.name(), "gemini");
    }

    #[test]
    fn test_to_gemini_request_includes_system_instruction() {
        let provider = GeminiProvider::new("test-key".to_string());
        let request = CompletionRequest {
            model: "gemini-1.5-pro".to_string(),
            prompt: "Hello".to_string(),
            system: Some("Be concise".to_string()),
            temperature: Some(0.2),
            max_tokens: Some(256),
            tools: vec![],
            extra: std::collections::HashMap::new(),
        };
        let gemini_req = provider.to_gemini_request(&request);
        assert!(gemini_req.system_instruction.is_some());
        assert_eq!(gemini_req.contents[0].parts[0].text.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_parse_rate_limit_error() {
        let provider = GeminiProvider::new("test-key".to_string());
        let error_json = r#"{"error":{"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        let error = provider.parse_error(StatusCode::TOO_MANY_REQUESTS, error_json);
        match error {
            ProviderError::RateLimitExceeded => {}
            _ => panic!("Expected RateLimitExceeded error"),
        }
    }
}
