// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow and step definitions, and the result types the engine produces.

use crate::config::ApiConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How a step's `ApiConfig` is executed against the current loop variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Executed once.
    Direct,
    /// Executed once per item of `loopSelector`'s result, with bounded
    /// concurrent fan-out.
    Loop,
}

/// A single step in a [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub api_config: ApiConfig,

    /// Integration this step calls through, resolved against the parent
    /// `Workflow`'s `integration_ids`.
    #[serde(default)]
    pub integration_id: Option<String>,

    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,

    /// JSONata-style expression, evaluated over `{payload, credentials,
    /// steps}`, producing the array this step loops over (loop mode only).
    #[serde(default)]
    pub loop_selector: Option<String>,

    /// Caps the number of `loop_selector` items actually executed, on top
    /// of `ServerDefaults::max_loop_iterations`. `None` defers entirely to
    /// the server default.
    #[serde(default)]
    pub loop_max_iters: Option<usize>,

    /// Variable name each loop item is bound to while substituting into
    /// this step's `ApiConfig`. Defaults to `"currentItem"`.
    #[serde(default = "default_loop_var")]
    pub loop_variable: String,

    /// JSONata-style expression, evaluated over `{payload, credentials,
    /// steps, previousResponse}`, producing this step's resolved input.
    #[serde(default)]
    pub input_mapping: Option<String>,

    /// JSONata-style expression, evaluated over `{response: <raw step
    /// output>}`, producing the value this step publishes into
    /// `steps.<id>` for later steps and the final transform. Distinct
    /// from `api_config.response_mapping`, which narrows the raw HTTP/SQL
    /// response before pagination accumulation; this one runs once more,
    /// after the whole step (including any loop fan-out) has finished.
    #[serde(default)]
    pub response_mapping: Option<String>,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Direct
}

fn default_loop_var() -> String {
    "currentItem".to_string()
}

/// A linear sequence of steps plus the payload/credential schema and final
/// output transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub org_id: Option<String>,

    pub steps: Vec<ExecutionStep>,

    /// Every integration id any step references; step ids are unique
    /// within a workflow and every `integration_id` they name must appear
    /// here (validated by [`Workflow::validate`]).
    #[serde(default)]
    pub integration_ids: Vec<String>,

    /// JSON Schema describing the expected call-time payload.
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// JSON Schema the final transformed output must satisfy.
    #[serde(default)]
    pub response_schema: Option<Value>,

    /// JSONata-style expression, evaluated over `{steps, payload,
    /// credentials}`, producing the workflow's final result.
    #[serde(default)]
    pub final_transform: Option<String>,

    #[serde(default)]
    pub instruction: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Structural validation per spec.md §3: step ids unique within the
    /// workflow, and every step's `integration_id` resolvable against
    /// `integration_ids`.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen_step_ids = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen_step_ids.insert(step.id.as_str()) {
                return Err(crate::error::OrchestratorError::ValidationError(format!(
                    "duplicate step id '{}' in workflow '{}'",
                    step.id, self.id
                )));
            }
            if let Some(integration_id) = &step.integration_id {
                if !self.integration_ids.iter().any(|id| id == integration_id) {
                    return Err(crate::error::OrchestratorError::ValidationError(format!(
                        "step '{}' references integration '{}' not listed in workflow.integration_ids",
                        step.id, integration_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of executing a single [`ExecutionStep`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default)]
    pub raw_data: Option<Value>,
    #[serde(default)]
    pub transformed_data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,

    /// Number of self-healing repair attempts consumed by this step.
    #[serde(default)]
    pub heal_attempts: u32,
}

impl StepResult {
    pub fn ok(step_id: impl Into<String>, raw_data: Value, transformed_data: Value) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            raw_data: Some(raw_data),
            transformed_data: Some(transformed_data),
            error: None,
            heal_attempts: 0,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            raw_data: None,
            transformed_data: None,
            error: Some(error.into()),
            heal_attempts: 0,
        }
    }
}

/// Outcome of executing an entire [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// The `{payload, credentials, steps}` scope threaded through mappings as
/// the engine progresses through a workflow's steps.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub payload: Value,
    pub credentials: HashMap<String, Value>,
    /// Transformed output of each completed step, keyed by step id.
    pub steps: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(payload: Value, credentials: HashMap<String, Value>) -> Self {
        Self {
            payload,
            credentials,
            steps: HashMap::new(),
        }
    }

    /// Builds the JSON object expressions are evaluated against.
    pub fn as_json(&self) -> Value {
        serde_json::json!({
            "payload": self.payload,
            "credentials": self.credentials,
            "steps": self.steps,
        })
    }

    pub fn record_step(&mut self, step_id: &str, transformed: Value) {
        self.steps.insert(step_id.to_string(), transformed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_context_serializes_payload_credentials_steps() {
        let mut ctx = WorkflowContext::new(serde_json::json!({"id": 1}), HashMap::new());
        ctx.record_step("step1", serde_json::json!({"ok": true}));
        let json = ctx.as_json();
        assert_eq!(json["payload"]["id"], 1);
        assert_eq!(json["steps"]["step1"]["ok"], true);
    }

    #[test]
    fn step_result_ok_sets_success_true() {
        let result = StepResult::ok("s1", serde_json::json!({}), serde_json::json!({}));
        assert!(result.success);
        assert_eq!(result.heal_attempts, 0);
    }

    fn sample_step(id: &str, integration_id: Option<&str>) -> ExecutionStep {
        ExecutionStep {
            id: id.to_string(),
            api_config: ApiConfig {
                id: format!("{id}-config"),
                url_host: "https://api.example.com".to_string(),
                url_path: String::new(),
                method: crate::config::HttpMethod::Get,
                headers: HashMap::new(),
                query_params: HashMap::new(),
                body: None,
                authentication: crate::config::AuthenticationType::None,
                pagination: None,
                data_path: None,
                response_schema: None,
                response_mapping: None,
                instruction: String::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            integration_id: integration_id.map(str::to_string),
            execution_mode: ExecutionMode::Direct,
            loop_selector: None,
            loop_max_iters: None,
            loop_variable: "currentItem".to_string(),
            input_mapping: None,
            response_mapping: None,
        }
    }

    fn sample_workflow(steps: Vec<ExecutionStep>, integration_ids: Vec<String>) -> Workflow {
        Workflow {
            id: "wf1".to_string(),
            org_id: None,
            steps,
            integration_ids,
            input_schema: None,
            response_schema: None,
            final_transform: None,
            instruction: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let workflow = sample_workflow(vec![sample_step("s1", None), sample_step("s1", None)], vec![]);
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn validate_rejects_unresolvable_integration_id() {
        let workflow = sample_workflow(vec![sample_step("s1", Some("stripe"))], vec![]);
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn validate_passes_when_integration_ids_resolve() {
        let workflow = sample_workflow(vec![sample_step("s1", Some("stripe"))], vec!["stripe".to_string()]);
        assert!(workflow.validate().is_ok());
    }
}
