// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pluggable datastore for the execution runtime (spec.md §9): a single
//! `Datastore` trait with `memory`/`file`/`postgres` backends, selected at
//! startup via `DATASTORE_TYPE`, mirroring how `superglue_providers` picks
//! a provider via `provider_from_env`.

pub mod crypto;
pub mod error;
pub mod file;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod traits;

pub use crypto::CredentialCipher;
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use records::{ConfigKind, RunRecord, StoredConfig, TenantInfo};
pub use traits::{Datastore, Page};

use std::sync::Arc;

/// Which backend `datastore_from_env` should construct, read from
/// `DATASTORE_TYPE` (`memory` | `file` | `postgres`). Defaults to `memory`
/// when unset, matching the teacher's fail-open-to-local-dev posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreKind {
    Memory,
    File,
    Postgres,
}

impl std::str::FromStr for DatastoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(StoreError::InvalidConfig(format!("unknown DATASTORE_TYPE '{other}'"))),
        }
    }
}

/// Builds the configured `Datastore` from environment variables:
/// `DATASTORE_TYPE` selects the backend, `FILE_STORE_DIR` (default
/// `./superglue_data`) configures the file backend, and the Postgres
/// backend reads `POSTGRES_{HOST,PORT,USERNAME,PASSWORD,DB}`. Backends
/// that persist credentials (`file`, `postgres`) require
/// `MASTER_ENCRYPTION_KEY`; the memory backend does not.
pub async fn datastore_from_env() -> Result<Arc<dyn Datastore>> {
    let kind = std::env::var("DATASTORE_TYPE")
        .ok()
        .map(|s| s.parse::<DatastoreKind>())
        .transpose()?
        .unwrap_or(DatastoreKind::Memory);

    match kind {
        DatastoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        DatastoreKind::File => {
            let dir = std::env::var("FILE_STORE_DIR").unwrap_or_else(|_| "./superglue_data".to_string());
            let cipher = CredentialCipher::from_env()?;
            Ok(Arc::new(FileStore::open(dir, cipher)?))
        }
        DatastoreKind::Postgres => {
            let cipher = CredentialCipher::from_env()?;
            Ok(Arc::new(PostgresStore::connect_from_env(cipher).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_kind_parses_known_values() {
        assert_eq!("memory".parse::<DatastoreKind>().unwrap(), DatastoreKind::Memory);
        assert_eq!("FILE".parse::<DatastoreKind>().unwrap(), DatastoreKind::File);
        assert_eq!("postgres".parse::<DatastoreKind>().unwrap(), DatastoreKind::Postgres);
    }

    #[test]
    fn datastore_kind_rejects_unknown_values() {
        assert!("sqlite".parse::<DatastoreKind>().is_err());
    }

    #[tokio::test]
    async fn datastore_from_env_defaults_to_memory() {
        std::env::remove_var("DATASTORE_TYPE");
        let store = datastore_from_env().await.unwrap();
        store.ping().await.unwrap();
    }
}
