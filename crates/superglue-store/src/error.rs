// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the datastore layer. Distinct from
//! `superglue_core::OrchestratorError::DatastoreError` so callers that only
//! depend on `superglue-store` don't need to pull in the whole runtime —
//! the two are bridged at the edge where a `StoreError` becomes part of a
//! masked `RunResult::error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("credential encryption error: {0}")]
    Crypto(String),

    #[error("{0} is required and was not set")]
    MissingConfig(&'static str),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for superglue_core::OrchestratorError {
    fn from(err: StoreError) -> Self {
        superglue_core::OrchestratorError::DatastoreError(err.to_string())
    }
}
