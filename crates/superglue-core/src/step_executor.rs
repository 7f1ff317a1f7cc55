// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executes one `ApiConfig`: routes to the HTTP or Postgres transport by
//! URL scheme, drives pagination, applies `responseMapping`, and validates
//! the result against `responseSchema`.

use crate::config::ApiConfig;
use crate::error::{OrchestratorError, Result};
use crate::expression;
use crate::http_caller::{HttpCaller, HttpResponse};
use crate::pagination::{PageFetcher, PaginationDriver};
use crate::postgres_caller::PostgresCaller;
use crate::substitution::VariableScope;
use serde_json::Value;
use std::collections::HashMap;

/// Dispatches a single page fetch to whichever transport `config.url_host`
/// names.
struct TransportFetcher<'a> {
    http: &'a HttpCaller,
    postgres: &'a PostgresCaller,
}

#[async_trait::async_trait]
impl<'a> PageFetcher for TransportFetcher<'a> {
    async fn fetch_page(&self, config: &ApiConfig, scope: &VariableScope) -> Result<HttpResponse> {
        if config.is_postgres() {
            self.postgres.call(config, scope).await
        } else {
            self.http.call(config, scope).await
        }
    }
}

pub struct StepExecutor {
    http: HttpCaller,
    postgres: PostgresCaller,
}

/// Outcome of executing one `ApiConfig`: the raw accumulated payload, the
/// `responseMapping`-transformed result, and the status/headers of the
/// *last* page fetched (spec's `{data, statusCode, headers}` executor
/// contract).
pub struct ExecutedCall {
    pub raw: Value,
    pub transformed: Value,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl StepExecutor {
    pub fn new(http: HttpCaller, postgres: PostgresCaller) -> Self {
        Self { http, postgres }
    }

    pub async fn execute(&self, config: &ApiConfig, scope: &VariableScope) -> Result<ExecutedCall> {
        let fetcher = TransportFetcher {
            http: &self.http,
            postgres: &self.postgres,
        };
        let driver = PaginationDriver::new(&fetcher);
        let paginated = driver.run(config, scope).await?;
        let raw = paginated.data;

        validate_schema(config, &raw)?;

        let transformed = match &config.response_mapping {
            Some(expr) => {
                let ctx = serde_json::json!({ "response": raw.clone() });
                expression::evaluate_bounded(expr, &ctx, expression::DEFAULT_EVALUATION_TIMEOUT)
                    .await
                    .map_err(|e| OrchestratorError::ExpressionError(format!("responseMapping failed: {e}")))?
            }
            None => raw.clone(),
        };

        Ok(ExecutedCall {
            raw,
            transformed,
            status_code: paginated.status,
            headers: paginated.headers,
        })
    }
}

fn validate_schema(config: &ApiConfig, value: &Value) -> Result<()> {
    let Some(schema) = &config.response_schema else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| OrchestratorError::ValidationError(format!("invalid responseSchema: {e}")))?;
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "response failed schema validation: {}",
            errors.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthenticationType, HttpMethod};
    use std::collections::HashMap;

    fn config_with_schema() -> ApiConfig {
        ApiConfig {
            id: "cfg".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
            authentication: AuthenticationType::None,
            pagination: None,
            data_path: None,
            response_schema: Some(serde_json::json!({
                "type": "object",
                "required": ["id"],
            })),
            response_mapping: None,
            instruction: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn validate_schema_passes_for_matching_value() {
        let config = config_with_schema();
        assert!(validate_schema(&config, &serde_json::json!({"id": 1})).is_ok());
    }

    #[test]
    fn validate_schema_fails_for_missing_required_field() {
        let config = config_with_schema();
        assert!(validate_schema(&config, &serde_json::json!({})).is_err());
    }
}
