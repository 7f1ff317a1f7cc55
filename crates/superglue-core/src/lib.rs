// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution runtime for the self-healing API orchestration engine:
//! expression evaluation, variable substitution, HTTP/Postgres callers,
//! pagination, step execution, self-healing repair, the workflow engine,
//! OAuth token lifecycle, and the static integration catalog.
//!
//! `superglue-store` builds on top of this crate's types (`ApiConfig`,
//! `Workflow`, `Integration`, `WorkflowResult`) to persist them; this crate
//! itself has no datastore dependency.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod healing;
pub mod http_caller;
pub mod integration;
pub mod masking;
pub mod oauth;
pub mod pagination;
pub mod postgres_caller;
pub mod retry;
pub mod step_executor;
pub mod substitution;
pub mod workflow;

pub use config::{ApiConfig, AuthenticationType, ExecutionOptions, HttpMethod, Pagination, PaginationType, SelfHealingMode};
pub use error::{OrchestratorError, Result};
pub use healing::{DocumentationSearch, NoDocumentationSearch, ResponseEvaluation, SelfHealingCoordinator};
pub use http_caller::HttpCaller;
pub use integration::{Integration, OAuthState};
pub use postgres_caller::PostgresCaller;
pub use step_executor::StepExecutor;
pub use workflow::{ExecutionMode, ExecutionStep, StepResult, Workflow, WorkflowContext, WorkflowResult};

pub use engine::WorkflowEngine;

/// Library version, exposed for diagnostics (`superglue-cli --version` and
/// run-record provenance).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server-wide tunables that aren't per-request `ExecutionOptions`, mirroring
/// spec.md's `server_defaults` environment overrides.
#[derive(Debug, Clone)]
pub struct ServerDefaults {
    /// Bound on a single suspension point (HTTP call, Postgres query,
    /// expression evaluation): `server_defaults.TIMEOUT`.
    pub timeout: std::time::Duration,
    /// Bound on an entire workflow run: `options.workflowTimeout`.
    pub workflow_timeout: std::time::Duration,
    /// Upper bound on loop-mode items actually executed, absent an explicit
    /// `loopMaxIters` on the step.
    pub max_loop_iterations: usize,
    /// Bounded concurrent fan-out within a single loop-mode step.
    pub max_loop_concurrency: usize,
    /// Ceiling on pagination requests when a `stopCondition` is configured.
    pub max_pagination_requests: usize,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            workflow_timeout: std::time::Duration::from_secs(120),
            max_loop_iterations: 100,
            max_loop_concurrency: 5,
            max_pagination_requests: pagination::MAX_PAGINATION_REQUESTS,
        }
    }
}

impl ServerDefaults {
    /// Reads overrides from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: env_secs("SERVER_TIMEOUT_SECS").unwrap_or(defaults.timeout),
            workflow_timeout: env_secs("SERVER_WORKFLOW_TIMEOUT_SECS").unwrap_or(defaults.workflow_timeout),
            max_loop_iterations: env_usize("MAX_LOOP_ITERATIONS").unwrap_or(defaults.max_loop_iterations),
            max_loop_concurrency: env_usize("MAX_LOOP_CONCURRENCY").unwrap_or(defaults.max_loop_concurrency),
            max_pagination_requests: env_usize("MAX_PAGINATION_REQUESTS").unwrap_or(defaults.max_pagination_requests),
        }
    }
}

fn env_secs(key: &str) -> Option<std::time::Duration> {
    std::env::var(key).ok()?.parse::<u64>().ok().map(std::time::Duration::from_secs)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_default_matches_spec_values() {
        let defaults = ServerDefaults::default();
        assert_eq!(defaults.timeout, std::time::Duration::from_secs(30));
        assert_eq!(defaults.max_loop_concurrency, 5);
    }
}
