// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the execution runtime.
//!
//! Every variant here corresponds to one of the error kinds the self-healing
//! coordinator and the pagination driver need to distinguish: transient
//! errors are retried, semantic errors are repaired by the LLM, and abort
//! errors bypass healing entirely.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the execution runtime.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The remote endpoint returned a non-2xx status or a malformed body.
    #[error("API call failed ({status_code:?}): {message}")]
    ApiCallError {
        status_code: Option<u16>,
        message: String,
    },

    /// A non-retryable semantic error from the LLM or a validator. Bypasses
    /// the self-healing loop.
    #[error("aborted: {0}")]
    AbortError(String),

    /// Two consecutive pagination pages were identical and non-empty.
    #[error("pagination parameters are not varying between requests: {0}")]
    PaginationConfigError(String),

    /// A stop condition never fired against two consecutive empty responses.
    #[error("stop condition did not fire on empty response: {0}")]
    StopConditionError(String),

    /// The endpoint returned an HTML document instead of structured data.
    #[error("Received HTML response instead of expected data format")]
    HtmlResponseError,

    /// A 429 response whose `Retry-After` would exceed the wait budget.
    #[error("rate limit exceeded, retry would require waiting {wait:?}")]
    RateLimitExceeded { wait: Duration },

    /// OAuth token refresh failed.
    #[error("OAuth token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// A datastore operation failed.
    #[error("datastore error: {0}")]
    DatastoreError(String),

    /// A suspension point exceeded its configured timeout.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Expression/template evaluation failed.
    #[error("expression evaluation error: {0}")]
    ExpressionError(String),

    /// A referenced step id does not exist in the workflow.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// A step's configuration did not match the step's declared type.
    #[error("invalid step config for step '{step_id}': {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    /// A workflow/config failed structural validation.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Catch-all for errors that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error should bypass the self-healing loop entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AbortError(_))
    }

    /// Whether the pagination driver raised this — used by the workflow
    /// engine to decide whether a step failure is recoverable.
    pub fn is_pagination_error(&self) -> bool {
        matches!(
            self,
            Self::PaginationConfigError(_) | Self::StopConditionError(_) | Self::HtmlResponseError
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(format!("serialization error: {err}"))
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        Self::ApiCallError {
            status_code,
            message: err.to_string(),
        }
    }
}
