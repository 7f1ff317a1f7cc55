// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory `Datastore`: process-local, never persisted, reset on
//! restart. Credentials are never serialized off-process so they aren't
//! passed through `CredentialCipher` here — the encryption boundary in
//! spec.md §9 protects data at rest, and this backend has no "rest".

use crate::error::{Result, StoreError};
use crate::records::{ConfigKind, RunRecord, StoredConfig, TenantInfo};
use crate::traits::{Datastore, Page};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use superglue_core::Integration;

#[derive(Default)]
pub struct MemoryStore {
    configs: DashMap<(String, ConfigKind, String), StoredConfig>,
    runs: DashMap<(String, String), RunRecord>,
    integrations: DashMap<(String, String), Integration>,
    tenants: DashMap<String, TenantInfo>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn upsert_config(&self, org_id: &str, config: StoredConfig) -> Result<StoredConfig> {
        let key = (org_id.to_string(), config.kind(), config.id().to_string());
        let created_at = self
            .configs
            .get(&key)
            .map(|existing| config_created_at(&existing))
            .unwrap_or_else(Utc::now);
        let stamped = config.with_timestamps(created_at, Utc::now());
        self.configs.insert(key, stamped.clone());
        Ok(stamped)
    }

    async fn get_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<Option<StoredConfig>> {
        let key = (org_id.to_string(), kind, id.to_string());
        Ok(self.configs.get(&key).map(|r| r.value().clone()))
    }

    async fn get_many_configs(&self, org_id: &str, kind: ConfigKind, ids: &[String]) -> Result<Vec<StoredConfig>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.configs.get(&(org_id.to_string(), kind, id.clone())).map(|r| r.value().clone()))
            .collect())
    }

    async fn list_configs(&self, org_id: &str, kind: ConfigKind, limit: usize, offset: usize) -> Result<Page<StoredConfig>> {
        let mut matching: Vec<StoredConfig> = self
            .configs
            .iter()
            .filter(|entry| entry.key().0 == org_id && entry.key().1 == kind)
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.id().cmp(b.id()));
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn delete_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<bool> {
        let key = (org_id.to_string(), kind, id.to_string());
        Ok(self.configs.remove(&key).is_some())
    }

    async fn create_run(&self, run: RunRecord) -> Result<RunRecord> {
        let key = (run.org_id.clone(), run.id.clone());
        self.runs.insert(key, run.clone());
        Ok(run)
    }

    async fn finalize_run(&self, run: RunRecord) -> Result<RunRecord> {
        let key = (run.org_id.clone(), run.id.clone());
        self.runs.insert(key, run.clone());
        Ok(run)
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.get(&(org_id.to_string(), id.to_string())).map(|r| r.value().clone()))
    }

    async fn list_runs(&self, org_id: &str, limit: usize, offset: usize, config_id: Option<&str>) -> Result<Page<RunRecord>> {
        let mut matching: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|entry| entry.key().0 == org_id)
            .map(|entry| entry.value().clone())
            .filter(|run| config_id.map(|cid| run.config_id.as_deref() == Some(cid)).unwrap_or(true))
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn upsert_integration(&self, org_id: &str, integration: Integration) -> Result<Integration> {
        let key = (org_id.to_string(), integration.id.clone());
        let mut stamped = integration;
        stamped.created_at = self
            .integrations
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);
        stamped.updated_at = Utc::now();
        self.integrations.insert(key, stamped.clone());
        Ok(stamped)
    }

    async fn get_integration(&self, org_id: &str, id: &str) -> Result<Option<Integration>> {
        Ok(self.integrations.get(&(org_id.to_string(), id.to_string())).map(|r| r.value().clone()))
    }

    async fn get_many_integrations(&self, org_id: &str, ids: &[String]) -> Result<Vec<Integration>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.integrations.get(&(org_id.to_string(), id.clone())).map(|r| r.value().clone()))
            .collect())
    }

    async fn list_integrations(&self, org_id: &str, limit: usize, offset: usize) -> Result<Page<Integration>> {
        let mut matching: Vec<Integration> = self
            .integrations
            .iter()
            .filter(|entry| entry.key().0 == org_id)
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool> {
        Ok(self.integrations.remove(&(org_id.to_string(), id.to_string())).is_some())
    }

    async fn get_tenant_info(&self, org_id: &str) -> Result<Option<TenantInfo>> {
        Ok(self.tenants.get(org_id).map(|r| r.value().clone()))
    }

    async fn upsert_tenant_info(&self, info: TenantInfo) -> Result<TenantInfo> {
        self.tenants.insert(info.org_id.clone(), info.clone());
        Ok(info)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

fn config_created_at(config: &StoredConfig) -> chrono::DateTime<Utc> {
    match config {
        StoredConfig::Api(c) | StoredConfig::Extract(c) | StoredConfig::Transform(c) => c.created_at,
        StoredConfig::Workflow(w) => w.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use superglue_core::{ApiConfig, AuthenticationType, HttpMethod};
    use std::collections::HashMap;

    fn sample_api(id: &str) -> ApiConfig {
        ApiConfig {
            id: id.to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
            authentication: AuthenticationType::None,
            pagination: None,
            data_path: None,
            response_schema: None,
            response_mapping: None,
            instruction: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .upsert_config("org1", StoredConfig::Api(sample_api("cfg1")))
            .await
            .unwrap();
        let fetched = store.get_config("org1", ConfigKind::Api, "cfg1").await.unwrap();
        assert!(matches!(fetched, Some(StoredConfig::Api(c)) if c.id == "cfg1"));
    }

    #[tokio::test]
    async fn get_missing_config_returns_none() {
        let store = MemoryStore::new();
        let fetched = store.get_config("org1", ConfigKind::Api, "missing").await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn get_many_configs_skips_missing_ids() {
        let store = MemoryStore::new();
        store
            .upsert_config("org1", StoredConfig::Api(sample_api("cfg1")))
            .await
            .unwrap();
        let fetched = store
            .get_many_configs("org1", ConfigKind::Api, &["cfg1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn list_runs_is_newest_first() {
        let store = MemoryStore::new();
        let mut older = RunRecord::started("run1", "org1", None, serde_json::json!({}));
        older.started_at = Utc::now() - chrono::Duration::minutes(10);
        let newer = RunRecord::started("run2", "org1", None, serde_json::json!({}));
        store.create_run(older).await.unwrap();
        store.create_run(newer).await.unwrap();

        let page = store.list_runs("org1", 10, 0, None).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, "run2");
    }

    #[tokio::test]
    async fn delete_config_reports_whether_it_existed() {
        let store = MemoryStore::new();
        store
            .upsert_config("org1", StoredConfig::Api(sample_api("cfg1")))
            .await
            .unwrap();
        assert!(store.delete_config("org1", ConfigKind::Api, "cfg1").await.unwrap());
        assert!(!store.delete_config("org1", ConfigKind::Api, "cfg1").await.unwrap());
    }
}
