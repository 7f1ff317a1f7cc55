// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The self-healing coordinator: when a step's request or transform fails
//! and self-healing is enabled, this drives an LLM through a bounded
//! repair loop using a two-tool protocol — `searchDocumentation` to pull in
//! more context, `submit` to propose a fix.
//!
//! Temperature rises with each attempt (`min(retryCount * 0.1, 1.0)`) so a
//! coordinator stuck repeating the same broken fix explores more broadly
//! before giving up.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use superglue_providers::{CompletionRequest, LLMProvider, ToolDefinition};
use tracing::{info, warn};

/// Repair attempts exhausted before the coordinator gives up and surfaces
/// the original failure — `server_defaults.MAX_CALL_RETRIES`.
const MAX_CALL_RETRIES: u32 = 8;

/// Cap on the error text appended to the LLM session (spec §4.5 step 2:
/// "truncated to 2000 chars").
const MAX_ERROR_CHARS: usize = 2000;

/// Cap on the sampled payload shown to the model, approximating the spec's
/// `contextLength/10` budget for an assumed 8000-char context window.
const MAX_PAYLOAD_CHARS: usize = 800;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut truncated: String = s.chars().take(max).collect();
        truncated.push_str("... [truncated]");
        truncated
    }
}

const SYSTEM_PROMPT: &str = "You are an API integration engineer fixing a broken workflow step. \
Use searchDocumentation to look up anything you're unsure about, and submit a corrected configuration \
as soon as you're confident in it. Never fabricate fields you haven't verified.";

const PROMPT_TEMPLATE: &str = r#"## Step instruction
{{instruction}}
{{#if documentation}}
## Integration documentation
{{documentation}}
{{/if}}
{{#if credentials}}
## Available credential names
{{credentials}}
(reference these by name; never invent credential values)
{{/if}}

## Failing payload
```json
{{payload}}
```

## Error
{{error}}
{{#if transcript}}
## Prior attempts
{{transcript}}
{{/if}}

Propose a fix by calling the `submit` tool with a corrected payload, or call `searchDocumentation` first if you need more context."#;

const EVALUATION_SYSTEM_PROMPT: &str = "You are reviewing the output of an API call made on behalf of an \
automated workflow. Decide whether the response actually satisfies the step's instruction, not merely \
whether the HTTP call succeeded.";

const EVALUATION_PROMPT_TEMPLATE: &str = r#"## Step instruction
{{instruction}}
{{#if documentation}}
## Integration documentation
{{documentation}}
{{/if}}

## Response data
```json
{{data}}
```

Call `submitEvaluation` with your verdict: does this response actually satisfy the instruction?"#;

/// Verdict returned by the success-path response evaluator (spec's self-healing
/// step 1): whether a step's response actually satisfies its instruction, not
/// merely whether the HTTP call itself succeeded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvaluation {
    pub success: bool,
    #[serde(default)]
    pub refactor_needed: bool,
    #[serde(default)]
    pub short_reason: String,
}

/// Looks up integration documentation on the coordinator's behalf — backed
/// by an integration's `documentation_url`, a cached doc index, or
/// whatever external search the embedding application wires in.
#[async_trait]
pub trait DocumentationSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<String>;
}

/// A `DocumentationSearch` that always reports nothing found — useful when
/// no documentation source is configured.
pub struct NoDocumentationSearch;

#[async_trait]
impl DocumentationSearch for NoDocumentationSearch {
    async fn search(&self, _query: &str) -> Result<String> {
        Ok("no documentation source is configured".to_string())
    }
}

pub struct SelfHealingCoordinator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_attempts: u32,
    renderer: Handlebars<'static>,
}

impl SelfHealingCoordinator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self::with_max_attempts(provider, model, MAX_CALL_RETRIES)
    }

    pub fn with_max_attempts(provider: Arc<dyn LLMProvider>, model: impl Into<String>, max_attempts: u32) -> Self {
        let mut renderer = Handlebars::new();
        renderer
            .register_template_string("healing_prompt", PROMPT_TEMPLATE)
            .expect("healing prompt template is valid handlebars");
        renderer
            .register_template_string("evaluation_prompt", EVALUATION_PROMPT_TEMPLATE)
            .expect("evaluation prompt template is valid handlebars");

        Self {
            provider,
            model: model.into(),
            max_attempts,
            renderer,
        }
    }

    /// Runs the repair loop, returning the `config` value the model
    /// submitted via the `submit` tool. The caller is responsible for
    /// interpreting/merging that value back into a concrete `ApiConfig` or
    /// mapping expression — the coordinator itself is payload-agnostic.
    pub async fn heal(
        &self,
        instruction: &str,
        documentation: &str,
        failing_payload: &Value,
        error_message: &str,
        credential_names: &[String],
        doc_search: &dyn DocumentationSearch,
    ) -> Result<Value> {
        let mut transcript = String::new();

        for attempt in 0..self.max_attempts {
            let temperature = (attempt as f32 * 0.1).min(1.0);
            let prompt = self.render_prompt(instruction, documentation, failing_payload, error_message, credential_names, &transcript)?;

            let request = CompletionRequest {
                model: self.model.clone(),
                prompt,
                system: Some(SYSTEM_PROMPT.to_string()),
                temperature: Some(temperature),
                max_tokens: Some(2048),
                tools: vec![search_documentation_tool(), submit_tool()],
                extra: Default::default(),
            };

            info!(attempt, temperature, "requesting self-healing completion");

            let response = self
                .provider
                .complete(request)
                .await
                .map_err(|e| OrchestratorError::Other(format!("self-healing LLM call failed: {e}")))?;

            let Some(call) = response.tool_calls.first() else {
                transcript.push_str(&format!("\n[assistant, no tool call] {}\n", response.text));
                continue;
            };

            match call.name.as_str() {
                "submit" => {
                    let config = call
                        .arguments
                        .get("config")
                        .cloned()
                        .unwrap_or_else(|| call.arguments.clone());
                    info!(attempt, "self-healing coordinator submitted a fix");
                    return Ok(config);
                }
                "searchDocumentation" => {
                    let query = call
                        .arguments
                        .get("query")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let result = doc_search
                        .search(query)
                        .await
                        .unwrap_or_else(|e| format!("documentation search failed: {e}"));
                    transcript.push_str(&format!("\n[searchDocumentation(\"{query}\")]\n{result}\n"));
                }
                other => {
                    warn!(tool = other, "self-healing coordinator called an unknown tool");
                    transcript.push_str(&format!("\n[unknown tool call: {other}, ignored]\n"));
                }
            }
        }

        Err(OrchestratorError::AbortError(format!(
            "self-healing exhausted {} attempts without a usable fix",
            self.max_attempts
        )))
    }

    fn render_prompt(
        &self,
        instruction: &str,
        documentation: &str,
        payload: &Value,
        error: &str,
        credential_names: &[String],
        transcript: &str,
    ) -> Result<String> {
        let sampled_payload = truncate_chars(&serde_json::to_string_pretty(payload).unwrap_or_default(), MAX_PAYLOAD_CHARS);
        let credentials = if credential_names.is_empty() {
            String::new()
        } else {
            credential_names.iter().map(|name| format!("- {name}")).collect::<Vec<_>>().join("\n")
        };
        let context = serde_json::json!({
            "instruction": instruction,
            "documentation": documentation,
            "payload": sampled_payload,
            "error": truncate_chars(error, MAX_ERROR_CHARS),
            "credentials": credentials,
            "transcript": transcript,
        });
        self.renderer
            .render("healing_prompt", &context)
            .map_err(|e| OrchestratorError::Other(format!("failed to render healing prompt: {e}")))
    }

    /// Success-path response evaluator (self-healing loop step 1): asks
    /// whether `data` actually satisfies `instruction`, given the
    /// integration's documentation, independent of whether the underlying
    /// HTTP call itself returned an error.
    pub async fn evaluate_response(
        &self,
        instruction: &str,
        documentation: &str,
        data: &Value,
    ) -> Result<ResponseEvaluation> {
        let context = serde_json::json!({
            "instruction": instruction,
            "documentation": documentation,
            "data": serde_json::to_string_pretty(data).unwrap_or_default(),
        });
        let prompt = self
            .renderer
            .render("evaluation_prompt", &context)
            .map_err(|e| OrchestratorError::Other(format!("failed to render evaluation prompt: {e}")))?;

        let request = CompletionRequest {
            model: self.model.clone(),
            prompt,
            system: Some(EVALUATION_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.0),
            max_tokens: Some(512),
            tools: vec![submit_evaluation_tool()],
            extra: Default::default(),
        };

        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| OrchestratorError::Other(format!("response evaluation LLM call failed: {e}")))?;

        let Some(call) = response.tool_calls.iter().find(|c| c.name == "submitEvaluation") else {
            return Ok(ResponseEvaluation {
                success: true,
                refactor_needed: false,
                short_reason: String::new(),
            });
        };

        serde_json::from_value(call.arguments.clone())
            .map_err(|e| OrchestratorError::Other(format!("malformed evaluation verdict: {e}")))
    }
}

fn search_documentation_tool() -> ToolDefinition {
    ToolDefinition {
        name: "searchDocumentation".to_string(),
        description: "Searches the integration's documentation for the given query.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"],
        }),
    }
}

fn submit_tool() -> ToolDefinition {
    ToolDefinition {
        name: "submit".to_string(),
        description: "Submits a corrected configuration or transform to replace the failing one.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "config": { "type": "object", "description": "The corrected payload." },
                "reasoning": { "type": "string" },
            },
            "required": ["config"],
        }),
    }
}

fn submit_evaluation_tool() -> ToolDefinition {
    ToolDefinition {
        name: "submitEvaluation".to_string(),
        description: "Reports whether the step's response actually satisfies its instruction.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "success": { "type": "boolean" },
                "refactorNeeded": { "type": "boolean" },
                "shortReason": { "type": "string" },
            },
            "required": ["success"],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use superglue_providers::{CompletionResponse, ProviderError, ToolCallRequest};

    struct ScriptedProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(CompletionResponse {
                    text: String::new(),
                    model: "test-model".to_string(),
                    tokens_used: None,
                    tool_calls: vec![ToolCallRequest {
                        name: "searchDocumentation".to_string(),
                        arguments: serde_json::json!({"query": "pagination"}),
                    }],
                    metadata: Default::default(),
                })
            } else {
                Ok(CompletionResponse {
                    text: String::new(),
                    model: "test-model".to_string(),
                    tokens_used: None,
                    tool_calls: vec![ToolCallRequest {
                        name: "submit".to_string(),
                        arguments: serde_json::json!({"config": {"fixed": true}}),
                    }],
                    metadata: Default::default(),
                })
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn heal_returns_submitted_config_after_doc_search() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider { calls: AtomicU32::new(0) });
        let coordinator = SelfHealingCoordinator::new(provider, "test-model");
        let result = coordinator
            .heal("call the list endpoint", "", &serde_json::json!({}), "404 not found", &[], &NoDocumentationSearch)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"fixed": true}));
    }

    #[tokio::test]
    async fn heal_gives_up_after_max_attempts_without_submit() {
        struct NeverSubmits;

        #[async_trait]
        impl LLMProvider for NeverSubmits {
            async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
                Ok(CompletionResponse {
                    text: "still thinking".to_string(),
                    model: "test-model".to_string(),
                    tokens_used: None,
                    tool_calls: vec![],
                    metadata: Default::default(),
                })
            }
            fn name(&self) -> &str {
                "never-submits"
            }
            async fn health_check(&self) -> std::result::Result<(), ProviderError> {
                Ok(())
            }
        }

        let provider: Arc<dyn LLMProvider> = Arc::new(NeverSubmits);
        let coordinator = SelfHealingCoordinator::with_max_attempts(provider, "test-model", 2);
        let result = coordinator
            .heal("call the list endpoint", "", &serde_json::json!({}), "timeout", &[], &NoDocumentationSearch)
            .await;
        assert!(matches!(result, Err(OrchestratorError::AbortError(_))));
    }

    struct EvaluationProvider {
        verdict: Value,
    }

    #[async_trait]
    impl LLMProvider for EvaluationProvider {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: String::new(),
                model: "test-model".to_string(),
                tokens_used: None,
                tool_calls: vec![ToolCallRequest {
                    name: "submitEvaluation".to_string(),
                    arguments: self.verdict.clone(),
                }],
                metadata: Default::default(),
            })
        }

        fn name(&self) -> &str {
            "evaluation"
        }

        async fn health_check(&self) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn evaluate_response_reports_negative_verdict() {
        let provider: Arc<dyn LLMProvider> = Arc::new(EvaluationProvider {
            verdict: serde_json::json!({"success": false, "refactorNeeded": true, "shortReason": "missing field"}),
        });
        let coordinator = SelfHealingCoordinator::new(provider, "test-model");
        let verdict = coordinator
            .evaluate_response("list widgets", "", &serde_json::json!({"widgets": []}))
            .await
            .unwrap();
        assert!(!verdict.success);
        assert!(verdict.refactor_needed);
        assert_eq!(verdict.short_reason, "missing field");
    }

    #[test]
    fn render_prompt_lists_credential_names() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider { calls: AtomicU32::new(0) });
        let coordinator = SelfHealingCoordinator::new(provider, "test-model");
        let names = vec!["apiKey".to_string(), "orgToken".to_string()];
        let prompt = coordinator
            .render_prompt("do thing", "", &serde_json::json!({}), "oops", &names, "")
            .unwrap();
        assert!(prompt.contains("apiKey"));
        assert!(prompt.contains("orgToken"));
    }

    #[test]
    fn render_prompt_omits_credentials_section_when_empty() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider { calls: AtomicU32::new(0) });
        let coordinator = SelfHealingCoordinator::new(provider, "test-model");
        let prompt = coordinator
            .render_prompt("do thing", "", &serde_json::json!({}), "oops", &[], "")
            .unwrap();
        assert!(!prompt.contains("Available credential names"));
    }

    #[test]
    fn truncate_chars_leaves_short_strings_untouched() {
        assert_eq!(truncate_chars("short", 2000), "short");
    }

    #[test]
    fn truncate_chars_caps_long_strings() {
        let long = "a".repeat(3000);
        let truncated = truncate_chars(&long, MAX_ERROR_CHARS);
        assert!(truncated.chars().count() <= MAX_ERROR_CHARS + "... [truncated]".len());
        assert!(truncated.ends_with("[truncated]"));
    }

    #[tokio::test]
    async fn evaluate_response_reports_positive_verdict() {
        let provider: Arc<dyn LLMProvider> = Arc::new(EvaluationProvider {
            verdict: serde_json::json!({"success": true}),
        });
        let coordinator = SelfHealingCoordinator::new(provider, "test-model");
        let verdict = coordinator
            .evaluate_response("list widgets", "", &serde_json::json!({"widgets": [1, 2]}))
            .await
            .unwrap();
        assert!(verdict.success);
        assert!(!verdict.refactor_needed);
    }
}
