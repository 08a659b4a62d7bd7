//! Persistent PKI records keyed by identity.
//!
//! A record is written once a registration succeeds and read on every
//! public-key request, which is how returning clients are recognised.
//!
//! # Backends
//!
//! - [`MemoryPkiStore`] - process-local, lost on restart
//! - [`FsJsonPkiStore`] - one JSON file per identity, cached, watched
//!
//! Rust guideline compliant 2026-02

pub mod fs_json;
pub mod watcher;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{PkiBackend, PkiConfig};
use crate::crypto::{KeyPair, PrivateKey};

pub use fs_json::FsJsonPkiStore;

/// Durable trust record for one identity.
///
/// Field names on disk match the historical `pki_map/*.json` layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkiRecord {
    /// Identity the record belongs to.
    pub id: String,
    /// Server public key issued to the identity.
    pub public_key: String,
    /// Matching server private key.
    pub private_key: PrivateKey,
    /// Client notification key committed at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_public_key: Option<String>,
}

impl PkiRecord {
    /// Build a record from an issued keypair.
    pub fn new(id: impl Into<String>, keypair: &KeyPair, notification_public_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            public_key: keypair.public_key.clone(),
            private_key: keypair.private_key.clone(),
            notification_public_key,
        }
    }

    /// The server keypair stored in this record.
    pub fn keypair(&self) -> KeyPair {
        KeyPair {
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
        }
    }
}

/// Durable get/set of PKI records.
#[async_trait]
pub trait PkiStore: Send + Sync {
    /// Look up the record for `id`. `Ok(None)` means no record exists.
    async fn get(&self, id: &str) -> Result<Option<PkiRecord>>;

    /// Create or replace the record for `record.id`.
    async fn set(&self, record: &PkiRecord) -> Result<()>;
}

/// In-memory store. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryPkiStore {
    records: RwLock<HashMap<String, PkiRecord>>,
}

impl MemoryPkiStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PkiStore for MemoryPkiStore {
    async fn get(&self, id: &str) -> Result<Option<PkiRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn set(&self, record: &PkiRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}

/// Open the store `config` selects.
pub fn open_store(config: &PkiConfig) -> Result<Arc<dyn PkiStore>> {
    match config.backend {
        PkiBackend::Memory => {
            log::warn!("Using in-memory PKI store; registrations will not survive a restart");
            Ok(Arc::new(MemoryPkiStore::new()))
        }
        PkiBackend::FsJson => Ok(Arc::new(FsJsonPkiStore::open(config.dir.clone(), config.watch)?)),
    }
}
