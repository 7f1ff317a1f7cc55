// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Record shapes persisted by the datastore, layered on top of
//! `superglue_core`'s in-memory types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use superglue_core::{ApiConfig, StepResult, Workflow};

/// The four saved-configuration families the GraphQL surface (out of
/// scope) lists separately (`listApis`/`listExtracts`/`listTransforms`/
/// `listWorkflows`) but which the datastore stores under one
/// `(id, kind, orgId)` key, per spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    /// A saved `ApiConfig` meant to be called directly (`call`).
    Api,
    /// An `ApiConfig` whose `dataPath`/`responseMapping` narrow a response
    /// down to a sub-document (`extract`).
    Extract,
    /// An `ApiConfig` used purely for its `responseMapping` over an
    /// already-fetched payload (`transform`).
    Transform,
    /// A multi-step `Workflow`.
    Workflow,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Workflow => "workflow",
        }
    }
}

impl std::str::FromStr for ConfigKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "extract" => Ok(Self::Extract),
            "transform" => Ok(Self::Transform),
            "workflow" => Ok(Self::Workflow),
            other => Err(format!("unknown config kind: {other}")),
        }
    }
}

/// A persisted configuration: either one of the `ApiConfig`-shaped kinds
/// (api/extract/transform) or a `Workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredConfig {
    Api(ApiConfig),
    Extract(ApiConfig),
    Transform(ApiConfig),
    Workflow(Box<Workflow>),
}

impl StoredConfig {
    pub fn kind(&self) -> ConfigKind {
        match self {
            Self::Api(_) => ConfigKind::Api,
            Self::Extract(_) => ConfigKind::Extract,
            Self::Transform(_) => ConfigKind::Transform,
            Self::Workflow(_) => ConfigKind::Workflow,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Api(c) | Self::Extract(c) | Self::Transform(c) => &c.id,
            Self::Workflow(w) => &w.id,
        }
    }

    /// Stamps `created_at`/`updated_at` the way an upsert should: the
    /// datastore sets these, never the caller (SPEC_FULL.md §3).
    pub fn with_timestamps(mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        match &mut self {
            Self::Api(c) | Self::Extract(c) | Self::Transform(c) => {
                c.created_at = created_at;
                c.updated_at = updated_at;
            }
            Self::Workflow(w) => {
                w.created_at = created_at;
                w.updated_at = updated_at;
            }
        }
        self
    }
}

/// A persisted execution record: covers both a single `call`'s `RunResult`
/// and a `Workflow`'s `WorkflowResult` (the latter via `step_results`).
/// Append-only: created at execution start with `success = false`,
/// finalized in place at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub org_id: String,
    /// The `ApiConfig`/`Workflow` id this run executed, if any (runs for
    /// ad-hoc inline configs may omit it).
    #[serde(default)]
    pub config_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// A value-snapshot of the config that was executed, so deleting the
    /// live config never invalidates run history.
    pub config_snapshot: Value,
    /// Present only for workflow runs.
    #[serde(default)]
    pub step_results: Option<Vec<StepResult>>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Constructs the initial append-only record for a run that hasn't
    /// finished yet.
    pub fn started(id: impl Into<String>, org_id: impl Into<String>, config_id: Option<String>, config_snapshot: Value) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.into(),
            config_id,
            success: false,
            data: None,
            error: None,
            status_code: None,
            headers: HashMap::new(),
            config_snapshot,
            step_results: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Multi-tenant metadata the Postgres backend keeps in its `tenant_info`
/// table; the memory/file backends treat it as an opaque per-org bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantInfo {
    pub org_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}
