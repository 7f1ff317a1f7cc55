// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Postgres-backed `Datastore`: a single `configurations` table keyed by
//! `(id, kind, org_id)`, plus `runs`, `integrations`, and `tenant_info`
//! tables, with a GIN index over `workflows`' `integration_ids` for
//! integration→workflow lookups — spec.md §4.8.

use crate::crypto::CredentialCipher;
use crate::error::{Result, StoreError};
use crate::records::{ConfigKind, RunRecord, StoredConfig, TenantInfo};
use crate::traits::{Datastore, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use superglue_core::Integration;
use tracing::info;

pub struct PostgresStore {
    pool: PgPool,
    cipher: CredentialCipher,
}

impl PostgresStore {
    pub async fn connect(connection_string: &str, cipher: CredentialCipher) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await?;
        let store = Self { pool, cipher };
        store.migrate().await?;
        Ok(store)
    }

    /// Connects using `POSTGRES_{HOST,PORT,USERNAME,PASSWORD,DB}` per
    /// spec.md §6.
    pub async fn connect_from_env(cipher: CredentialCipher) -> Result<Self> {
        let host = std::env::var("POSTGRES_HOST").map_err(|_| StoreError::MissingConfig("POSTGRES_HOST"))?;
        let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("POSTGRES_USERNAME").map_err(|_| StoreError::MissingConfig("POSTGRES_USERNAME"))?;
        let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
        let db = std::env::var("POSTGRES_DB").map_err(|_| StoreError::MissingConfig("POSTGRES_DB"))?;
        let connection_string = format!("postgres://{user}:{password}@{host}:{port}/{db}");
        Self::connect(&connection_string, cipher).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS configurations (
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                org_id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (id, kind, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_configurations_integration_ids
            ON configurations USING GIN ((data -> 'integration_ids'))
            WHERE kind = 'workflow'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                config_id TEXT,
                success BOOLEAN NOT NULL,
                data JSONB,
                error TEXT,
                status_code INTEGER,
                headers JSONB NOT NULL DEFAULT '{}'::jsonb,
                config_snapshot JSONB NOT NULL,
                step_results JSONB,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                PRIMARY KEY (id, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_org_started_at ON runs (org_id, started_at DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (id, org_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_info (
                org_id TEXT PRIMARY KEY,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("postgres datastore schema migrated");
        Ok(())
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

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        config_id: row.try_get("config_id")?,
        success: row.try_get("success")?,
        data: row.try_get::<Option<Value>, _>("data")?,
        error: row.try_get("error")?,
        status_code: row.try_get::<Option<i32>, _>("status_code")?.map(|v| v as u16),
        headers: serde_json::from_value(row.try_get::<Value, _>("headers")?)?,
        config_snapshot: row.try_get("config_snapshot")?,
        step_results: row.try_get::<Option<Value>, _>("step_results")?.map(serde_json::from_value).transpose()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
    })
}

#[async_trait]
impl Datastore for PostgresStore {
    async fn upsert_config(&self, org_id: &str, config: StoredConfig) -> Result<StoredConfig> {
        let kind = config.kind();
        let id = config.id().to_string();
        let now = Utc::now();

        let created_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT created_at FROM configurations WHERE id = $1 AND kind = $2 AND org_id = $3",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let stamped = config.with_timestamps(created_at.unwrap_or(now), now);
        let data = serde_json::to_value(&stamped)?;

        sqlx::query(
            r#"
            INSERT INTO configurations (id, kind, org_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id, kind, org_id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(org_id)
        .bind(&data)
        .bind(created_at.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(stamped)
    }

    async fn get_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<Option<StoredConfig>> {
        let row: Option<Value> = sqlx::query_scalar(
            "SELECT data FROM configurations WHERE id = $1 AND kind = $2 AND org_id = $3",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(serde_json::from_value).transpose().map_err(StoreError::from)
    }

    async fn get_many_configs(&self, org_id: &str, kind: ConfigKind, ids: &[String]) -> Result<Vec<StoredConfig>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT data FROM configurations WHERE kind = $1 AND org_id = $2 AND id = ANY($3)",
        )
        .bind(kind.as_str())
        .bind(org_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|v| serde_json::from_value(v).map_err(StoreError::from)).collect()
    }

    async fn list_configs(&self, org_id: &str, kind: ConfigKind, limit: usize, offset: usize) -> Result<Page<StoredConfig>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM configurations WHERE kind = $1 AND org_id = $2")
            .bind(kind.as_str())
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT data FROM configurations WHERE kind = $1 AND org_id = $2 ORDER BY id LIMIT $3 OFFSET $4",
        )
        .bind(kind.as_str())
        .bind(org_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total: total as usize })
    }

    async fn delete_config(&self, org_id: &str, kind: ConfigKind, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM configurations WHERE id = $1 AND kind = $2 AND org_id = $3")
            .bind(id)
            .bind(kind.as_str())
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: RunRecord) -> Result<RunRecord> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, org_id, config_id, success, data, error, status_code, headers, config_snapshot, step_results, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id, org_id) DO UPDATE SET
                success = EXCLUDED.success, data = EXCLUDED.data, error = EXCLUDED.error,
                status_code = EXCLUDED.status_code, headers = EXCLUDED.headers,
                step_results = EXCLUDED.step_results, completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&run.id)
        .bind(&run.org_id)
        .bind(&run.config_id)
        .bind(run.success)
        .bind(&run.data)
        .bind(&run.error)
        .bind(run.status_code.map(|v| v as i32))
        .bind(serde_json::to_value(&run.headers)?)
        .bind(&run.config_snapshot)
        .bind(run.step_results.as_ref().map(serde_json::to_value).transpose()?)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn finalize_run(&self, run: RunRecord) -> Result<RunRecord> {
        self.create_run(run).await
    }

    async fn get_run(&self, org_id: &str, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, org_id: &str, limit: usize, offset: usize, config_id: Option<&str>) -> Result<Page<RunRecord>> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM runs WHERE org_id = $1 AND ($2::text IS NULL OR config_id = $2)",
        )
        .bind(org_id)
        .bind(config_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE org_id = $1 AND ($2::text IS NULL OR config_id = $2)
            ORDER BY started_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(org_id)
        .bind(config_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(row_to_run).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total: total as usize })
    }

    async fn upsert_integration(&self, org_id: &str, integration: Integration) -> Result<Integration> {
        let now = Utc::now();
        let created_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT created_at FROM integrations WHERE id = $1 AND org_id = $2")
                .bind(&integration.id)
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        let mut plaintext = integration;
        plaintext.created_at = created_at.unwrap_or(now);
        plaintext.updated_at = now;

        let encrypted = self.encrypt_integration(plaintext.clone())?;
        let data = serde_json::to_value(&encrypted)?;

        sqlx::query(
            r#"
            INSERT INTO integrations (id, org_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id, org_id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&plaintext.id)
        .bind(org_id)
        .bind(&data)
        .bind(created_at.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(plaintext)
    }

    async fn get_integration(&self, org_id: &str, id: &str) -> Result<Option<Integration>> {
        let row: Option<Value> = sqlx::query_scalar("SELECT data FROM integrations WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(v) => Ok(Some(self.decrypt_integration(serde_json::from_value(v)?)?)),
            None => Ok(None),
        }
    }

    async fn get_many_integrations(&self, org_id: &str, ids: &[String]) -> Result<Vec<Integration>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Value> = sqlx::query_scalar("SELECT data FROM integrations WHERE org_id = $1 AND id = ANY($2)")
            .bind(org_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|v| -> Result<Integration> { self.decrypt_integration(serde_json::from_value(v)?) })
            .collect()
    }

    async fn list_integrations(&self, org_id: &str, limit: usize, offset: usize) -> Result<Page<Integration>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM integrations WHERE org_id = $1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<Value> = sqlx::query_scalar("SELECT data FROM integrations WHERE org_id = $1 ORDER BY id LIMIT $2 OFFSET $3")
            .bind(org_id)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(|v| -> Result<Integration> { self.decrypt_integration(serde_json::from_value(v)?) })
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total: total as usize })
    }

    async fn delete_integration(&self, org_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integrations WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_tenant_info(&self, org_id: &str) -> Result<Option<TenantInfo>> {
        let row: Option<Value> = sqlx::query_scalar("SELECT data FROM tenant_info WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(serde_json::from_value).transpose().map_err(StoreError::from)
    }

    async fn upsert_tenant_info(&self, info: TenantInfo) -> Result<TenantInfo> {
        let data = serde_json::to_value(&info)?;
        sqlx::query(
            r#"
            INSERT INTO tenant_info (org_id, data) VALUES ($1, $2)
            ON CONFLICT (org_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&info.org_id)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(info)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
