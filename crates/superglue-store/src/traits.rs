// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `Datastore` trait: one capability set (`get`, `list`, `upsert`,
//! `delete`, `ping`, `disconnect`) per entity family, implemented
//! independently by each backend rather than through a shared base class
//! (spec.md §9 "Pluggable datastore").
//!
//! Every method is `org_id`-scoped. Missing entities return `Ok(None)`
//! (`get`) or are silently skipped (`get_many`) rather than erroring —
//! spec.md §3 "Missing entities return null".

use crate::error::Result;
use crate::records::{ConfigKind, RunRecord, StoredConfig, TenantInfo};
use async_trait::async_trait;
use superglue_core::Integration;

/// A page of a `list*` call, alongside the total count matching the
/// filter (spec.md §8: "`total` equals the count of items matching the
/// filter").
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Creates or replaces a configuration, returning it with
    /// datastore-assigned timestamps. `id` is unique within
    /// `(org_id, kind)` — upserting with an existing id replaces it.
    async fn upsert_config(&self, org_id: &str, config: StoredConfig) -> Result<StoredConfig>;

    /// Returns `None` if no config with this id/kind exists for the org.
    async fn get_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<Option<StoredConfig>>;

    /// Looks up several ids at once, silently skipping ones that don't
    /// exist — never errors on a partial miss.
    async fn get_many_configs(&self, org_id: &str, kind: ConfigKind, ids: &[String]) -> Result<Vec<StoredConfig>>;

    async fn list_configs(&self, org_id: &str, kind: ConfigKind, limit: usize, offset: usize) -> Result<Page<StoredConfig>>;

    /// Returns whether a config existed and was deleted. No cascade:
    /// deleting a config referenced by historical runs leaves those runs'
    /// `config_snapshot` intact (spec.md §3 "Ownership").
    async fn delete_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<bool>;

    /// Creates the append-only run record at execution start.
    async fn create_run(&self, run: RunRecord) -> Result<RunRecord>;

    /// Overwrites a run record in place at execution completion. The
    /// datastore never mutates `started_at`/`id`/`org_id`.
    async fn finalize_run(&self, run: RunRecord) -> Result<RunRecord>;

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunRecord>>;

    /// Newest-first by `started_at`, ties broken by insertion order,
    /// optionally filtered to runs of one `config_id`.
    async fn list_runs(&self, org_id: &str, limit: usize, offset: usize, config_id: Option<&str>) -> Result<Page<RunRecord>>;

    /// Upserts an integration. Credentials are plaintext on this trait
    /// boundary in memory; backends are responsible for encrypting at
    /// their own storage edge.
    async fn upsert_integration(&self, org_id: &str, integration: Integration) -> Result<Integration>;

    async fn get_integration(&self, org_id: &str, id: &str) -> Result<Option<Integration>>;

    async fn get_many_integrations(&self, org_id: &str, ids: &[String]) -> Result<Vec<Integration>>;

    async fn list_integrations(&self, org_id: &str, limit: usize, offset: usize) -> Result<Page<Integration>>;

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool>;

    async fn get_tenant_info(&self, org_id: &str) -> Result<Option<TenantInfo>>;

    async fn upsert_tenant_info(&self, info: TenantInfo) -> Result<TenantInfo>;

    /// Verifies the backend is reachable (a connectivity check, not a
    /// correctness check).
    async fn ping(&self) -> Result<()>;

    /// Releases backend resources (connection pools, open file handles).
    /// Idempotent; safe to call on drop paths.
    async fn disconnect(&self) -> Result<()>;
}
