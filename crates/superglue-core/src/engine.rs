// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequential workflow engine: runs a `Workflow`'s steps in order, threading
//! each step's transformed output into the next step's `{payload,
//! credentials, steps}` scope, fanning loop-mode steps out across a bounded
//! pool of concurrent tasks, and applying `finalTransform` to the
//! accumulated step outputs.

use crate::config::{ApiConfig, ExecutionOptions};
use crate::error::{OrchestratorError, Result};
use crate::expression;
use crate::healing::{DocumentationSearch, SelfHealingCoordinator};
use crate::integration::Integration;
use crate::step_executor::StepExecutor;
use crate::substitution::VariableScope;
use crate::workflow::{ExecutionMode, ExecutionStep, StepResult, Workflow, WorkflowContext, WorkflowResult};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Upper bound on concurrently in-flight requests for a single loop-mode
/// step, regardless of how many items its `loopSelector` produces.
const MAX_LOOP_CONCURRENCY: usize = 5;

/// Default cap on loop-mode items actually executed, absent a step-level
/// `loop_max_iters` — `server_defaults.MAX_LOOP_ITERATIONS`.
const DEFAULT_MAX_LOOP_ITERATIONS: usize = 100;

pub struct WorkflowEngine {
    executor: Arc<StepExecutor>,
    healing: Option<Arc<SelfHealingCoordinator>>,
    doc_search: Arc<dyn DocumentationSearch>,
    options: ExecutionOptions,
    max_loop_iterations: usize,
    integrations: HashMap<String, Integration>,
    expression_timeout: std::time::Duration,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<StepExecutor>, options: ExecutionOptions) -> Self {
        Self {
            executor,
            healing: None,
            doc_search: Arc::new(crate::healing::NoDocumentationSearch),
            options,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            integrations: HashMap::new(),
            expression_timeout: expression::DEFAULT_EVALUATION_TIMEOUT,
        }
    }

    /// Overrides the server-default loop iteration cap (`ServerDefaults::max_loop_iterations`).
    pub fn with_max_loop_iterations(mut self, max_loop_iterations: usize) -> Self {
        self.max_loop_iterations = max_loop_iterations;
        self
    }

    /// Overrides the server-default bound on a single `inputMapping`/
    /// `responseMapping`/`finalTransform` evaluation (`ServerDefaults::timeout`).
    pub fn with_expression_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.expression_timeout = timeout;
        self
    }

    /// Compiles and evaluates a JSONata-style expression off the calling
    /// task, bounded by `self.expression_timeout` (spec.md §4.2/§5/§9: a
    /// sandboxed, worker-bounded evaluation on every mapping/transform
    /// call site).
    async fn eval_expr(&self, source: &str, context: &Value) -> Result<Value> {
        expression::evaluate_bounded(source, context, self.expression_timeout).await
    }

    pub fn with_healing(mut self, healing: Arc<SelfHealingCoordinator>, doc_search: Arc<dyn DocumentationSearch>) -> Self {
        self.healing = Some(healing);
        self.doc_search = doc_search;
        self
    }

    /// Supplies the `Integration` records steps reference by `integration_id`,
    /// keyed by `Integration::id` — their `documentation`/`specific_instructions`
    /// feed the self-healing prompt and response evaluator (spec §4.5 step 3).
    pub fn with_integrations(mut self, integrations: HashMap<String, Integration>) -> Self {
        self.integrations = integrations;
        self
    }

    /// Combines an integration's free-text documentation with its
    /// operator-authored `specificInstructions`, if the step names one.
    fn integration_documentation(&self, step: &ExecutionStep) -> String {
        let Some(id) = &step.integration_id else {
            return String::new();
        };
        let Some(integration) = self.integrations.get(id) else {
            return String::new();
        };
        let mut doc = integration.documentation.clone();
        if !integration.specific_instructions.is_empty() {
            if !doc.is_empty() {
                doc.push_str("\n\n");
            }
            doc.push_str(&integration.specific_instructions);
        }
        doc
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        payload: Value,
        credentials: std::collections::HashMap<String, Value>,
    ) -> WorkflowResult {
        let started_at = Utc::now();

        if let Err(e) = workflow.validate() {
            return WorkflowResult {
                workflow_id: workflow.id.clone(),
                success: false,
                data: None,
                error: Some(e.to_string()),
                step_results: Vec::new(),
                started_at,
                completed_at: Utc::now(),
            };
        }

        let mut context = WorkflowContext::new(payload, credentials);
        let mut step_results = Vec::with_capacity(workflow.steps.len());
        let mut overall_error = None;

        for step in &workflow.steps {
            let result = self.run_step(step, &context).await;
            match &result {
                Ok(step_result) => {
                    if let Some(transformed) = &step_result.transformed_data {
                        context.record_step(&step.id, transformed.clone());
                    }
                    step_results.push(step_result.clone());
                }
                Err(e) => {
                    error!(step_id = %step.id, error = %e, "step failed");
                    step_results.push(StepResult::failed(step.id.clone(), e.to_string()));
                    overall_error = Some(e.to_string());
                    break;
                }
            }
        }

        let success = overall_error.is_none();
        let data = if success {
            self.apply_final_transform(workflow, &context).await.ok()
        } else {
            None
        };

        WorkflowResult {
            workflow_id: workflow.id.clone(),
            success,
            data,
            error: overall_error,
            step_results,
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn run_step(&self, step: &ExecutionStep, context: &WorkflowContext) -> Result<StepResult> {
        let result = match step.execution_mode {
            ExecutionMode::Direct => self.run_direct_step(step, context, None).await,
            ExecutionMode::Loop => self.run_loop_step(step, context).await,
        }?;
        self.apply_step_response_mapping(step, context, result).await
    }

    /// Applies `step.response_mapping` (distinct from
    /// `api_config.response_mapping`, applied earlier inside the step
    /// executor) to the value this step publishes for later steps. When the
    /// mapping itself fails and healing is `ENABLED`/`TRANSFORM_ONLY`, asks
    /// the self-healing coordinator for a corrected expression instead of
    /// failing the step outright.
    async fn apply_step_response_mapping(&self, step: &ExecutionStep, context: &WorkflowContext, mut result: StepResult) -> Result<StepResult> {
        let Some(expr) = &step.response_mapping else {
            return Ok(result);
        };
        let Some(transformed) = result.transformed_data.clone() else {
            return Ok(result);
        };
        let ctx = serde_json::json!({ "response": transformed });
        match self.eval_expr(expr, &ctx).await {
            Ok(mapped) => {
                result.transformed_data = Some(mapped);
                Ok(result)
            }
            Err(e) if self.options.self_healing.heals_transforms() => {
                self.heal_response_mapping(step, expr, &transformed, &e.to_string(), context, result).await
            }
            Err(e) => Err(OrchestratorError::ExpressionError(format!("step responseMapping failed: {e}"))),
        }
    }

    /// Repairs a failing `step.responseMapping` expression: asks the
    /// coordinator for a corrected expression and re-evaluates it against
    /// the same response data.
    async fn heal_response_mapping(
        &self,
        step: &ExecutionStep,
        expr: &str,
        transformed: &Value,
        error_message: &str,
        context: &WorkflowContext,
        mut result: StepResult,
    ) -> Result<StepResult> {
        let Some(healing) = &self.healing else {
            return Err(OrchestratorError::ExpressionError(format!(
                "step responseMapping failed: {error_message}"
            )));
        };

        warn!(step_id = %step.id, error = %error_message, "attempting self-healing repair of responseMapping");

        let documentation = self.integration_documentation(step);
        let failing_payload = serde_json::json!({ "responseMapping": expr, "response": transformed });
        let credential_names: Vec<String> = context.credentials.keys().cloned().collect();
        let patch = healing
            .heal(
                &step.api_config.instruction,
                &documentation,
                &failing_payload,
                error_message,
                &credential_names,
                self.doc_search.as_ref(),
            )
            .await?;

        let repaired_expr = patch.get("responseMapping").and_then(Value::as_str).ok_or_else(|| {
            OrchestratorError::ExpressionError("self-healing did not return a responseMapping".to_string())
        })?;

        let ctx = serde_json::json!({ "response": transformed });
        let mapped = self
            .eval_expr(repaired_expr, &ctx)
            .await
            .map_err(|e| OrchestratorError::ExpressionError(format!("repaired step responseMapping failed: {e}")))?;

        result.transformed_data = Some(mapped);
        result.heal_attempts += 1;
        Ok(result)
    }

    async fn run_direct_step(
        &self,
        step: &ExecutionStep,
        context: &WorkflowContext,
        loop_item: Option<&Value>,
    ) -> Result<StepResult> {
        let scope = self.build_scope(step, context, loop_item).await?;

        match self.executor.execute(&step.api_config, &scope).await {
            Ok(call) => {
                if self.options.self_healing.heals_requests() {
                    if let Some(verdict_error) = self.check_response(step, &call.transformed).await {
                        return self.heal_and_retry(step, context, loop_item, &verdict_error).await;
                    }
                }
                Ok(StepResult::ok(step.id.clone(), call.raw, call.transformed))
            }
            Err(err) if self.options.self_healing.heals_requests() && !err.is_fatal() => {
                self.heal_and_retry(step, context, loop_item, &err).await
            }
            Err(err) => Err(err),
        }
    }

    /// Success-path response evaluator (spec §4.5 step 1): on a step that
    /// completed without an `ApiCallError`, asks the LLM whether the
    /// response actually satisfies the step's instruction. A negative
    /// verdict is surfaced as an error so the caller can route it into the
    /// same repair path as a hard HTTP failure.
    async fn check_response(&self, step: &ExecutionStep, data: &Value) -> Option<OrchestratorError> {
        let healing = self.healing.as_ref()?;
        let documentation = self.integration_documentation(step);
        match healing.evaluate_response(&step.api_config.instruction, &documentation, data).await {
            Ok(verdict) if !verdict.success => Some(OrchestratorError::ApiCallError {
                status_code: None,
                message: verdict.short_reason,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "response evaluation failed; accepting response as-is");
                None
            }
        }
    }

    async fn heal_and_retry(
        &self,
        step: &ExecutionStep,
        context: &WorkflowContext,
        loop_item: Option<&Value>,
        original_error: &OrchestratorError,
    ) -> Result<StepResult> {
        let Some(healing) = &self.healing else {
            return Err(original_error.clone_display());
        };

        warn!(step_id = %step.id, error = %original_error, "attempting self-healing repair");

        let documentation = self.integration_documentation(step);
        let failing_payload = serde_json::to_value(&step.api_config).unwrap_or(Value::Null);
        let credential_names: Vec<String> = context.credentials.keys().cloned().collect();
        let patch = healing
            .heal(
                &step.api_config.instruction,
                &documentation,
                &failing_payload,
                &original_error.to_string(),
                &credential_names,
                self.doc_search.as_ref(),
            )
            .await?;

        let mut patched_config = step.api_config.clone();
        merge_patch(&mut patched_config, &patch)?;

        let scope = self.build_scope(step, context, loop_item).await?;
        let call = self.executor.execute(&patched_config, &scope).await?;
        let mut result = StepResult::ok(step.id.clone(), call.raw, call.transformed);
        result.heal_attempts = 1;
        Ok(result)
    }

    async fn run_loop_step(&self, step: &ExecutionStep, context: &WorkflowContext) -> Result<StepResult> {
        let selector = step
            .loop_selector
            .as_ref()
            .ok_or_else(|| OrchestratorError::InvalidStepConfig {
                step_id: step.id.clone(),
                reason: "LOOP execution mode requires a loopSelector".to_string(),
            })?;

        let items = self.eval_expr(selector, &context.as_json()).await?;
        let items = match items {
            Value::Array(arr) => arr,
            Value::Null => vec![],
            other => vec![other],
        };

        let cap = step.loop_max_iters.unwrap_or(self.max_loop_iterations);
        let items = if items.len() > cap {
            warn!(step_id = %step.id, total = items.len(), cap, "loopSelector produced more items than the loop iteration cap; truncating");
            items.into_iter().take(cap).collect()
        } else {
            items
        };

        let semaphore = Arc::new(Semaphore::new(MAX_LOOP_CONCURRENCY));
        let mut tasks = Vec::with_capacity(items.len());

        for item in items {
            let permit = semaphore.clone();
            let step = step.clone();
            let context = context.clone();
            let engine_ref: &Self = self;
            tasks.push(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore is never closed");
                engine_ref.run_direct_step(&step, &context, Some(&item)).await
            });
        }

        let outcomes = futures::future::join_all(tasks).await;

        let mut raw_items = Vec::new();
        let mut transformed_items = Vec::new();
        for outcome in outcomes {
            let result = outcome?;
            if let Some(raw) = result.raw_data {
                raw_items.push(raw);
            }
            if let Some(transformed) = result.transformed_data {
                transformed_items.push(transformed);
            }
        }

        Ok(StepResult::ok(step.id.clone(), Value::Array(raw_items), Value::Array(transformed_items)))
    }

    async fn build_scope(
        &self,
        step: &ExecutionStep,
        context: &WorkflowContext,
        loop_item: Option<&Value>,
    ) -> Result<VariableScope> {
        let mut scope: VariableScope = context.credentials.clone();
        if let Value::Object(map) = &context.payload {
            for (k, v) in map {
                scope.insert(k.clone(), v.clone());
            }
        }
        for (step_id, value) in &context.steps {
            scope.insert(step_id.clone(), value.clone());
        }
        if let Some(item) = loop_item {
            scope.insert(step.loop_variable.clone(), item.clone());
        }

        if let Some(mapping) = &step.input_mapping {
            let mut ctx = context.as_json();
            if let Some(item) = loop_item {
                ctx["currentItem"] = item.clone();
            }
            let mapped = self.eval_expr(mapping, &ctx).await?;
            if let Value::Object(map) = mapped {
                for (k, v) in map {
                    scope.insert(k, v);
                }
            }
        }

        Ok(scope)
    }

    async fn apply_final_transform(&self, workflow: &Workflow, context: &WorkflowContext) -> Result<Value> {
        match &workflow.final_transform {
            Some(expr) => self.eval_expr(expr, &context.as_json()).await,
            None => Ok(Value::Object(
                context
                    .steps
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
        }
    }
}

/// Shallow-merges a JSON patch submitted by the self-healing coordinator
/// into an `ApiConfig`, re-deserializing the merged object.
fn merge_patch(config: &mut ApiConfig, patch: &Value) -> Result<()> {
    let mut current = serde_json::to_value(&*config)
        .map_err(|e| OrchestratorError::ExpressionError(format!("failed to serialize config for patching: {e}")))?;

    if let (Value::Object(base), Value::Object(overrides)) = (&mut current, patch) {
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
    }

    *config = serde_json::from_value(current)
        .map_err(|e| OrchestratorError::ExpressionError(format!("self-healing patch produced an invalid config: {e}")))?;
    Ok(())
}

impl OrchestratorError {
    /// Clones via display text — `OrchestratorError` doesn't derive `Clone`
    /// because some variants wrap non-`Clone` durations-adjacent state; this
    /// is only used on the "healing unavailable" fallback path.
    fn clone_display(&self) -> OrchestratorError {
        OrchestratorError::Other(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_overrides_instruction_field() {
        let mut config = ApiConfig {
            id: "cfg".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            method: crate::config::HttpMethod::Get,
            headers: Default::default(),
            query_params: Default::default(),
            body: None,
            authentication: crate::config::AuthenticationType::None,
            pagination: None,
            data_path: None,
            response_schema: None,
            response_mapping: None,
            instruction: "old".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        merge_patch(&mut config, &serde_json::json!({"instruction": "new"})).unwrap();
        assert_eq!(config.instruction, "new");
    }

    use crate::healing::NoDocumentationSearch;
    use crate::postgres_caller::PostgresCaller;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use superglue_providers::{CompletionRequest, CompletionResponse, LLMProvider, ProviderError, ToolCallRequest};

    fn test_step(id: &str, integration_id: Option<&str>, response_mapping: Option<&str>) -> ExecutionStep {
        ExecutionStep {
            id: id.to_string(),
            api_config: ApiConfig {
                id: "cfg".to_string(),
                url_host: "https://api.example.com".to_string(),
                url_path: String::new(),
                method: crate::config::HttpMethod::Get,
                headers: Default::default(),
                query_params: Default::default(),
                body: None,
                authentication: crate::config::AuthenticationType::None,
                pagination: None,
                data_path: None,
                response_schema: None,
                response_mapping: None,
                instruction: "list widgets".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            integration_id: integration_id.map(str::to_string),
            execution_mode: ExecutionMode::Direct,
            loop_selector: None,
            loop_max_iters: None,
            loop_variable: "currentItem".to_string(),
            input_mapping: None,
            response_mapping: response_mapping.map(str::to_string),
        }
    }

    fn test_integration(documentation: &str, specific_instructions: &str) -> Integration {
        Integration {
            id: "int1".to_string(),
            org_id: "org1".to_string(),
            name: "Test".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            credentials: Default::default(),
            oauth: None,
            documentation_url: None,
            documentation: documentation.to_string(),
            open_api_schema: None,
            specific_instructions: specific_instructions.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_engine() -> WorkflowEngine {
        let executor = Arc::new(StepExecutor::new(
            crate::http_caller::HttpCaller::new(reqwest::Client::new(), RetryPolicy::default()),
            PostgresCaller::new(),
        ));
        WorkflowEngine::new(executor, ExecutionOptions::default())
    }

    struct VerdictProvider {
        verdict: Value,
    }

    #[async_trait]
    impl LLMProvider for VerdictProvider {
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
            "verdict"
        }
        async fn health_check(&self) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn check_response_surfaces_negative_verdict_as_error() {
        let provider: Arc<dyn LLMProvider> = Arc::new(VerdictProvider {
            verdict: serde_json::json!({"success": false, "shortReason": "response is missing the widgets field"}),
        });
        let coordinator = Arc::new(SelfHealingCoordinator::new(provider, "test-model"));
        let engine = test_engine().with_healing(coordinator, Arc::new(NoDocumentationSearch));

        let step = test_step("step1", None, None);
        let err = engine.check_response(&step, &serde_json::json!({})).await;
        assert!(matches!(err, Some(OrchestratorError::ApiCallError { message, .. }) if message == "response is missing the widgets field"));
    }

    #[tokio::test]
    async fn check_response_accepts_positive_verdict() {
        let provider: Arc<dyn LLMProvider> = Arc::new(VerdictProvider {
            verdict: serde_json::json!({"success": true}),
        });
        let coordinator = Arc::new(SelfHealingCoordinator::new(provider, "test-model"));
        let engine = test_engine().with_healing(coordinator, Arc::new(NoDocumentationSearch));

        let step = test_step("step1", None, None);
        let err = engine.check_response(&step, &serde_json::json!({"widgets": []})).await;
        assert!(err.is_none());
    }

    #[test]
    fn integration_documentation_combines_doc_and_specific_instructions() {
        let mut integrations = HashMap::new();
        integrations.insert("int1".to_string(), test_integration("General docs.", "Always paginate by 50."));
        let engine = test_engine().with_integrations(integrations);

        let step = test_step("step1", Some("int1"), None);
        let doc = engine.integration_documentation(&step);
        assert_eq!(doc, "General docs.\n\nAlways paginate by 50.");
    }

    #[test]
    fn integration_documentation_empty_when_step_has_no_integration() {
        let engine = test_engine();
        let step = test_step("step1", None, None);
        assert_eq!(engine.integration_documentation(&step), "");
    }

    struct SubmitProvider {
        config: Value,
    }

    #[async_trait]
    impl LLMProvider for SubmitProvider {
        async fn complete(&self, _request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: String::new(),
                model: "test-model".to_string(),
                tokens_used: None,
                tool_calls: vec![ToolCallRequest {
                    name: "submit".to_string(),
                    arguments: serde_json::json!({"config": self.config.clone()}),
                }],
                metadata: Default::default(),
            })
        }
        fn name(&self) -> &str {
            "submit"
        }
        async fn health_check(&self) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transform_only_healing_repairs_a_broken_response_mapping() {
        let provider: Arc<dyn LLMProvider> = Arc::new(SubmitProvider {
            config: serde_json::json!({"responseMapping": "response.items"}),
        });
        let coordinator = Arc::new(SelfHealingCoordinator::new(provider, "test-model"));
        let mut options = ExecutionOptions::default();
        options.self_healing = crate::config::SelfHealingMode::TransformOnly;
        let executor = Arc::new(StepExecutor::new(
            crate::http_caller::HttpCaller::new(reqwest::Client::new(), RetryPolicy::default()),
            PostgresCaller::new(),
        ));
        let engine = WorkflowEngine::new(executor, options).with_healing(coordinator, Arc::new(NoDocumentationSearch));

        let step = test_step("step1", None, Some("response.items["));
        let result = StepResult::ok(
            "step1".to_string(),
            serde_json::json!({"items": [1, 2]}),
            serde_json::json!({"items": [1, 2]}),
        );

        let context = WorkflowContext::new(Value::Null, Default::default());
        let healed = engine.apply_step_response_mapping(&step, &context, result).await.unwrap();
        assert_eq!(healed.transformed_data, Some(serde_json::json!([1, 2])));
        assert_eq!(healed.heal_attempts, 1);
    }

    #[tokio::test]
    async fn response_mapping_failure_propagates_without_a_healing_coordinator() {
        let engine = test_engine();
        let step = test_step("step1", None, Some("response.missing_field.nested["));
        let result = StepResult::ok("step1".to_string(), Value::Null, serde_json::json!({"items": [1]}));
        let context = WorkflowContext::new(Value::Null, Default::default());
        let outcome = engine.apply_step_response_mapping(&step, &context, result).await;
        assert!(outcome.is_err());
    }
}
