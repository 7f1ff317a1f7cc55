// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! File-backed `Datastore`: configs/integrations/tenant_info live in one
//! indexed JSON document (`<dir>/superglue_data.json`), runs live in an
//! append-only JSONL log (`<dir>/superglue_logs.jsonl`) — spec.md §6
//! "On-disk layout".
//!
//! The whole document is guarded by one `parking_lot::Mutex` and
//! rewritten atomically (write to a temp file, then rename) on every
//! mutation; this backend targets local/single-node operation, not
//! high-throughput concurrent writers.

use crate::crypto::CredentialCipher;
use crate::error::{Result, StoreError};
use crate::records::{ConfigKind, RunRecord, StoredConfig, TenantInfo};
use crate::traits::{Datastore, Page};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use superglue_core::Integration;
use tracing::warn;

const DATA_FILE: &str = "superglue_data.json";
const LOG_FILE: &str = "superglue_logs.jsonl";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataDocument {
    #[serde(default)]
    apis: HashMap<String, StoredConfig>,
    #[serde(default)]
    extracts: HashMap<String, StoredConfig>,
    #[serde(default)]
    transforms: HashMap<String, StoredConfig>,
    #[serde(default)]
    workflows: HashMap<String, StoredConfig>,
    /// Keyed by `"{org_id}:{id}"`, credentials encrypted at rest.
    #[serde(default)]
    integrations: HashMap<String, Integration>,
    #[serde(default)]
    tenant_info: HashMap<String, TenantInfo>,
}

impl DataDocument {
    fn table(&self, kind: ConfigKind) -> &HashMap<String, StoredConfig> {
        match kind {
            ConfigKind::Api => &self.apis,
            ConfigKind::Extract => &self.extracts,
            ConfigKind::Transform => &self.transforms,
            ConfigKind::Workflow => &self.workflows,
        }
    }

    fn table_mut(&mut self, kind: ConfigKind) -> &mut HashMap<String, StoredConfig> {
        match kind {
            ConfigKind::Api => &mut self.apis,
            ConfigKind::Extract => &mut self.extracts,
            ConfigKind::Transform => &mut self.transforms,
            ConfigKind::Workflow => &mut self.workflows,
        }
    }
}

fn scoped_key(org_id: &str, id: &str) -> String {
    format!("{org_id}:{id}")
}

pub struct FileStore {
    dir: PathBuf,
    cipher: CredentialCipher,
    doc: Mutex<DataDocument>,
}

impl FileStore {
    /// Loads (or initializes) the document at `dir`. `dir` is created if
    /// missing.
    pub fn open(dir: impl Into<PathBuf>, cipher: CredentialCipher) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let doc = Self::load_document(&dir)?;
        Ok(Self {
            dir,
            cipher,
            doc: Mutex::new(doc),
        })
    }

    fn load_document(dir: &Path) -> Result<DataDocument> {
        let path = dir.join(DATA_FILE);
        if !path.exists() {
            return Ok(DataDocument::default());
        }
        let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        if raw.trim().is_empty() {
            return Ok(DataDocument::default());
        }
        serde_json::from_str(&raw).map_err(StoreError::from)
    }

    /// Writes the document via a temp-file-then-rename so a crash mid-write
    /// never leaves a half-written `superglue_data.json` behind.
    fn persist(&self, doc: &DataDocument) -> Result<()> {
        let path = self.dir.join(DATA_FILE);
        let tmp_path = self.dir.join(format!("{DATA_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(doc)?;
        {
            let mut f = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
            f.write_all(&body).map_err(|e| io_err(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn append_run(&self, run: &RunRecord) -> Result<()> {
        let path = self.log_path();
        let mut line = serde_json::to_string(run)?;
        line.push('\n');
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        f.write_all(line.as_bytes()).map_err(|e| io_err(&path, e))
    }

    /// Reads every line of the run log, keeping the last record per id
    /// (create-then-finalize append pattern) and filtering corrupted
    /// entries — spec.md §4.8 "tolerates corrupted lines".
    fn load_runs(&self) -> Result<Vec<RunRecord>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let mut by_id: HashMap<String, RunRecord> = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(run) if is_well_formed(&run) => {
                    by_id.insert(run.id.clone(), run);
                }
                Ok(_) => {
                    warn!(lineno, "skipping run log entry missing required fields");
                }
                Err(e) => {
                    warn!(lineno, error = %e, "skipping corrupted run log entry");
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    fn encrypt_integration(&self, mut integration: Integration) -> Result<Integration> {
        integration.credentials = self.cipher.encrypt_map(&integration.credentials)?;
        if let Some(oauth) = &mut integration.oauth {
            oauth.access_token = self.cipher.encrypt(&oauth.access_token)?;
            if let Some(refresh) = &oauth.refresh_token {
                oauth.refresh_token = Some(self.cipher.encrypt(refresh)?);
            }
            oauth.client_secret = self.cipher.encrypt(&oauth.client_secret)?;
        }
        Ok(integration)
    }

    fn decrypt_integration(&self, mut integration: Integration) -> Result<Integration> {
        integration.credentials = self.cipher.decrypt_map(&integration.credentials)?;
        if let Some(oauth) = &mut integration.oauth {
            oauth.access_token = self.cipher.decrypt(&oauth.access_token)?;
            if let Some(refresh) = &oauth.refresh_token {
                oauth.refresh_token = Some(self.cipher.decrypt(refresh)?);
            }
            oauth.client_secret = self.cipher.decrypt(&oauth.client_secret)?;
        }
        Ok(integration)
    }
}

/// A log entry is well-formed if it has a non-empty `id` and, whenever it
/// carries a config snapshot at all, that snapshot has an `id` field —
/// spec.md §4.8 "filtering entries with missing id, startedAt, or
/// config.id" (`startedAt` is a non-optional field, so serde already
/// rejects a line missing it).
fn is_well_formed(run: &RunRecord) -> bool {
    if run.id.is_empty() {
        return false;
    }
    match &run.config_snapshot {
        Value::Null => true,
        Value::Object(obj) => obj.contains_key("id"),
        _ => false,
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Datastore for FileStore {
    async fn upsert_config(&self, org_id: &str, config: StoredConfig) -> Result<StoredConfig> {
        let mut doc = self.doc.lock();
        let key = scoped_key(org_id, config.id());
        let kind = config.kind();
        let created_at = doc
            .table(kind)
            .get(&key)
            .map(config_created_at)
            .unwrap_or_else(Utc::now);
        let stamped = config.with_timestamps(created_at, Utc::now());
        doc.table_mut(kind).insert(key, stamped.clone());
        self.persist(&doc)?;
        Ok(stamped)
    }

    async fn get_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<Option<StoredConfig>> {
        let doc = self.doc.lock();
        Ok(doc.table(kind).get(&scoped_key(org_id, id)).cloned())
    }

    async fn get_many_configs(&self, org_id: &str, kind: ConfigKind, ids: &[String]) -> Result<Vec<StoredConfig>> {
        let doc = self.doc.lock();
        Ok(ids
            .iter()
            .filter_map(|id| doc.table(kind).get(&scoped_key(org_id, id)).cloned())
            .collect())
    }

    async fn list_configs(&self, org_id: &str, kind: ConfigKind, limit: usize, offset: usize) -> Result<Page<StoredConfig>> {
        let doc = self.doc.lock();
        let prefix = format!("{org_id}:");
        let mut matching: Vec<StoredConfig> = doc
            .table(kind)
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect();
        matching.sort_by(|a, b| a.id().cmp(b.id()));
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn delete_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<bool> {
        let mut doc = self.doc.lock();
        let removed = doc.table_mut(kind).remove(&scoped_key(org_id, id)).is_some();
        if removed {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    async fn create_run(&self, run: RunRecord) -> Result<RunRecord> {
        self.append_run(&run)?;
        Ok(run)
    }

    async fn finalize_run(&self, run: RunRecord) -> Result<RunRecord> {
        self.append_run(&run)?;
        Ok(run)
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunRecord>> {
        let runs = self.load_runs()?;
        Ok(runs.into_iter().find(|r| r.org_id == org_id && r.id == id))
    }

    async fn list_runs(&self, org_id: &str, limit: usize, offset: usize, config_id: Option<&str>) -> Result<Page<RunRecord>> {
        let mut matching: Vec<RunRecord> = self
            .load_runs()?
            .into_iter()
            .filter(|r| r.org_id == org_id)
            .filter(|r| config_id.map(|cid| r.config_id.as_deref() == Some(cid)).unwrap_or(true))
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn upsert_integration(&self, org_id: &str, integration: Integration) -> Result<Integration> {
        let mut doc = self.doc.lock();
        let key = scoped_key(org_id, &integration.id);
        let created_at = doc
            .integrations
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);

        let mut plaintext = integration;
        plaintext.created_at = created_at;
        plaintext.updated_at = Utc::now();

        let encrypted = self.encrypt_integration(plaintext.clone())?;
        doc.integrations.insert(key, encrypted);
        self.persist(&doc)?;
        Ok(plaintext)
    }

    async fn get_integration(&self, org_id: &str, id: &str) -> Result<Option<Integration>> {
        let doc = self.doc.lock();
        match doc.integrations.get(&scoped_key(org_id, id)) {
            Some(encrypted) => Ok(Some(self.decrypt_integration(encrypted.clone())?)),
            None => Ok(None),
        }
    }

    async fn get_many_integrations(&self, org_id: &str, ids: &[String]) -> Result<Vec<Integration>> {
        let doc = self.doc.lock();
        let mut out = Vec::new();
        for id in ids {
            if let Some(encrypted) = doc.integrations.get(&scoped_key(org_id, id)) {
                out.push(self.decrypt_integration(encrypted.clone())?);
            }
        }
        Ok(out)
    }

    async fn list_integrations(&self, org_id: &str, limit: usize, offset: usize) -> Result<Page<Integration>> {
        let doc = self.doc.lock();
        let prefix = format!("{org_id}:");
        let mut matching: Vec<Integration> = doc
            .integrations
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        let total = matching.len();
        let decrypted: Result<Vec<Integration>> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|i| self.decrypt_integration(i))
            .collect();
        Ok(Page { items: decrypted?, total })
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool> {
        let mut doc = self.doc.lock();
        let removed = doc.integrations.remove(&scoped_key(org_id, id)).is_some();
        if removed {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    async fn get_tenant_info(&self, org_id: &str) -> Result<Option<TenantInfo>> {
        let doc = self.doc.lock();
        Ok(doc.tenant_info.get(org_id).cloned())
    }

    async fn upsert_tenant_info(&self, info: TenantInfo) -> Result<TenantInfo> {
        let mut doc = self.doc.lock();
        doc.tenant_info.insert(info.org_id.clone(), info.clone());
        self.persist(&doc)?;
        Ok(info)
    }

    async fn ping(&self) -> Result<()> {
        if self.dir.exists() {
            Ok(())
        } else {
            Err(StoreError::InvalidConfig(format!("storage dir {} does not exist", self.dir.display())))
        }
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
    use std::collections::HashMap as Map;
    use superglue_core::{ApiConfig, AuthenticationType, HttpMethod};
    use tempfile::tempdir;

    fn sample_api(id: &str) -> ApiConfig {
        ApiConfig {
            id: id.to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            method: HttpMethod::Get,
            headers: Map::new(),
            query_params: Map::new(),
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

    fn cipher() -> CredentialCipher {
        CredentialCipher::new("test-master-key-for-file-store-tests")
    }

    #[tokio::test]
    async fn run_survives_reopening_the_store() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), cipher()).unwrap();
            let run = RunRecord::started("run1", "org1", Some("cfg1".to_string()), serde_json::json!({"id": "cfg1"}));
            store.create_run(run).await.unwrap();
        }
        let reopened = FileStore::open(dir.path(), cipher()).unwrap();
        let run = reopened.get_run("org1", "run1").await.unwrap();
        assert!(run.is_some());
    }

    #[tokio::test]
    async fn finalize_overwrites_the_created_record_for_the_same_id() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), cipher()).unwrap();
        let started = RunRecord::started("run1", "org1", None, serde_json::json!({"id": "cfg1"}));
        store.create_run(started.clone()).await.unwrap();

        let mut finished = started;
        finished.success = true;
        finished.completed_at = Some(Utc::now());
        store.finalize_run(finished).await.unwrap();

        let run = store.get_run("org1", "run1").await.unwrap().unwrap();
        assert!(run.success);
    }

    #[tokio::test]
    async fn corrupted_log_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), cipher()).unwrap();
        let run = RunRecord::started("run1", "org1", None, serde_json::json!({"id": "cfg1"}));
        store.create_run(run).await.unwrap();

        let log_path = dir.path().join(LOG_FILE);
        let mut f = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(f, "{{not valid json").unwrap();
        writeln!(f, "{{\"missing\": \"fields\"}}").unwrap();

        let page = store.list_runs("org1", 10, 0, None).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn integration_credentials_round_trip_through_encryption() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), cipher()).unwrap();
        let mut creds = Map::new();
        creds.insert("apiKey".to_string(), "sk-live-123".to_string());
        let integration = Integration {
            id: "int1".to_string(),
            org_id: "org1".to_string(),
            name: "Test Integration".to_string(),
            url_host: "https://api.example.com".to_string(),
            url_path: String::new(),
            credentials: creds,
            oauth: None,
            documentation_url: None,
            documentation: String::new(),
            open_api_schema: None,
            specific_instructions: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_integration("org1", integration).await.unwrap();

        let raw = fs::read_to_string(dir.path().join(DATA_FILE)).unwrap();
        assert!(!raw.contains("sk-live-123"), "plaintext credential leaked onto disk");

        let fetched = store.get_integration("org1", "int1").await.unwrap().unwrap();
        assert_eq!(fetched.credentials.get("apiKey"), Some(&"sk-live-123".to_string()));
    }

    #[tokio::test]
    async fn config_upsert_get_round_trip_excluding_timestamps() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), cipher()).unwrap();
        store
            .upsert_config("org1", StoredConfig::Api(sample_api("cfg1")))
            .await
            .unwrap();
        let fetched = store.get_config("org1", ConfigKind::Api, "cfg1").await.unwrap().unwrap();
        assert_eq!(fetched.id(), "cfg1");
    }
}
