// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executes a single Postgres `ApiConfig` — `config.body` holds a
//! parameterized SQL statement (`$1`, `$2`, ...) and `config.query_params`
//! supplies, in insertion order, the values bound to those placeholders
//! after substitution. Returns the same `HttpResponse`-shaped value the
//! HTTP caller produces so downstream mapping/pagination code doesn't need
//! to know which transport ran.

use crate::config::ApiConfig;
use crate::error::{OrchestratorError, Result};
use crate::http_caller::HttpResponse;
use crate::masking::mask_credentials;
use crate::substitution::{substitute, VariableScope};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct PostgresCaller {
    pools: dashmap::DashMap<String, PgPool>,
}

impl PostgresCaller {
    pub fn new() -> Self {
        Self {
            pools: dashmap::DashMap::new(),
        }
    }

    async fn pool_for(&self, connection_string: &str) -> Result<PgPool> {
        if let Some(pool) = self.pools.get(connection_string) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(connection_string)
            .await
            .map_err(|e| OrchestratorError::DatastoreError(format!("failed to connect: {e}")))?;
        self.pools.insert(connection_string.to_string(), pool.clone());
        Ok(pool)
    }

    /// Executes `config.body` as a parameterized SQL statement.
    pub async fn call(&self, config: &ApiConfig, scope: &VariableScope) -> Result<HttpResponse> {
        let connection_string = substitute(&config.full_url(), scope);
        let pool = self
            .pool_for(&connection_string)
            .await
            .map_err(|e| mask_pool_error(e, scope))?;

        let sql = config
            .body
            .as_ref()
            .ok_or_else(|| OrchestratorError::InvalidStepConfig {
                step_id: config.id.clone(),
                reason: "postgres config is missing a SQL statement in `body`".to_string(),
            })?;
        let sql = substitute(sql, scope);

        debug!(sql = %mask_credentials(&sql, scope), "executing postgres statement");

        let mut query = sqlx::query(&sql);
        // `query_params` is an ordered map from `$1`, `$2`, ... to a
        // template substituted against `scope`, mirroring the HTTP
        // caller's header/query substitution.
        let mut ordered: Vec<(&String, &String)> = config.query_params.iter().collect();
        ordered.sort_by_key(|(k, _)| param_index(k));
        for (_, template) in ordered {
            query = query.bind(substitute(template, scope));
        }

        let rows = query
            .fetch_all(&pool)
            .await
            .map_err(|e| OrchestratorError::DatastoreError(mask_credentials(&format!("query failed: {e}"), scope)))?;

        let body = rows_to_json(&rows);

        Ok(HttpResponse {
            status: 200,
            body,
            headers: HashMap::new(),
        })
    }
}

impl Default for PostgresCaller {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_pool_error(err: OrchestratorError, scope: &VariableScope) -> OrchestratorError {
    match err {
        OrchestratorError::DatastoreError(message) => OrchestratorError::DatastoreError(mask_credentials(&message, scope)),
        other => other,
    }
}

fn param_index(key: &str) -> usize {
    key.trim_start_matches('$').parse().unwrap_or(usize::MAX)
}

fn rows_to_json(rows: &[sqlx::postgres::PgRow]) -> Value {
    let results: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for column in row.columns() {
                let name = column.name();
                let value = row
                    .try_get::<Option<String>, _>(name)
                    .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                    .or_else(|_| row.try_get::<Option<i64>, _>(name).map(|v| v.map(|n| serde_json::json!(n)).unwrap_or(Value::Null)))
                    .or_else(|_| row.try_get::<Option<f64>, _>(name).map(|v| v.map(|n| serde_json::json!(n)).unwrap_or(Value::Null)))
                    .or_else(|_| row.try_get::<Option<bool>, _>(name).map(|v| v.map(Value::Bool).unwrap_or(Value::Null)))
                    .or_else(|_| row.try_get::<Option<Value>, _>(name).map(|v| v.unwrap_or(Value::Null)))
                    .unwrap_or(Value::Null);
                obj.insert(name.to_string(), value);
            }
            Value::Object(obj)
        })
        .collect();
    Value::Array(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_index_parses_dollar_prefixed_keys() {
        assert_eq!(param_index("$1"), 1);
        assert_eq!(param_index("$2"), 2);
        assert_eq!(param_index("not-a-param"), usize::MAX);
    }

    #[test]
    fn mask_pool_error_strips_credential_values() {
        let mut scope = VariableScope::new();
        scope.insert("dbPassword".to_string(), Value::String("s3cr3t-password".to_string()));

        let err = OrchestratorError::DatastoreError("failed to connect: password s3cr3t-password rejected".to_string());
        let masked = mask_pool_error(err, &scope);

        match masked {
            OrchestratorError::DatastoreError(message) => {
                assert!(!message.contains("s3cr3t-password"));
                assert!(message.contains("****"));
            }
            other => panic!("expected DatastoreError, got {other:?}"),
        }
    }
}
