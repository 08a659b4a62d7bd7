//! PKI store backed by one JSON file per identity.
//!
//! # Storage structure
//!
//! ```text
//! {dir}/
//!     {identity}.json          # safe identities keep their name
//!     {sha256(identity)}.json  # anything else is hashed
//! ```
//!
//! Writes go to a temporary sibling that is synced and renamed over the
//! record, so a crash never leaves a half-written record behind. Reads
//! are cached; when watching is enabled a [`DirWatcher`] drops cache
//! entries whose files are touched by someone else.
//!
//! Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::watcher::DirWatcher;
use super::{PkiRecord, PkiStore};

/// Longest identity stored under its own name.
const MAX_PLAIN_NAME_LEN: usize = 128;

type RecordCache = Arc<RwLock<HashMap<String, PkiRecord>>>;

/// Directory of pretty-printed JSON records.
#[derive(Debug)]
pub struct FsJsonPkiStore {
    dir: PathBuf,
    /// Keyed by file name so watcher events map straight onto entries.
    cache: RecordCache,
    _watcher: Option<DirWatcher>,
}

impl FsJsonPkiStore {
    /// Open (creating if needed) the record directory.
    ///
    /// With `watch` set, external changes to record files invalidate the
    /// in-memory cache.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or watched.
    pub fn open(dir: impl Into<PathBuf>, watch: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create PKI directory {}", dir.display()))?;

        let cache: RecordCache = Arc::default();
        let watcher = if watch {
            let cache = Arc::clone(&cache);
            Some(DirWatcher::spawn(&dir, move |event| {
                if !event.is_mutation() {
                    return;
                }
                let Some(name) = event.path.file_name().and_then(|n| n.to_str()) else {
                    return;
                };
                let mut cache = cache.write().unwrap_or_else(|e| e.into_inner());
                if cache.remove(name).is_some() {
                    log::debug!("PKI cache entry invalidated: {name}");
                }
            })?)
        } else {
            None
        };

        log::info!("PKI store at {}", dir.display());
        Ok(Self {
            dir,
            cache,
            _watcher: watcher,
        })
    }

    fn cached(&self, name: &str) -> Option<PkiRecord> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn remember(&self, name: String, record: PkiRecord) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, record);
    }
}

/// File name for `id`, hashing anything that is not a plain file name.
pub fn file_name_for_id(id: &str) -> String {
    let plain = !id.is_empty()
        && id.len() <= MAX_PLAIN_NAME_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if plain {
        format!("{id}.json")
    } else {
        format!("{:x}.json", Sha256::digest(id.as_bytes()))
    }
}

#[async_trait]
impl PkiStore for FsJsonPkiStore {
    async fn get(&self, id: &str) -> Result<Option<PkiRecord>> {
        let name = file_name_for_id(id);
        if let Some(record) = self.cached(&name) {
            return Ok(Some(record));
        }

        let path = self.dir.join(&name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let record: PkiRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        anyhow::ensure!(
            record.id == id,
            "Record {} belongs to a different identity",
            path.display()
        );

        self.remember(name, record.clone());
        Ok(Some(record))
    }

    async fn set(&self, record: &PkiRecord) -> Result<()> {
        let name = file_name_for_id(&record.id);
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{name}.tmp"));

        let content =
            serde_json::to_string_pretty(record).context("Failed to serialize PKI record")?;

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write PKI record")?;
        file.sync_all().await.context("Failed to sync PKI record")?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .context("Failed to set PKI record permissions")?;
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to move PKI record into {}", path.display()))?;

        self.remember(name, record.clone());
        log::debug!("Saved PKI record to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn record(id: &str, notification_key: Option<&str>) -> PkiRecord {
        PkiRecord {
            id: id.to_string(),
            public_key: format!("pub-{id}"),
            private_key: PrivateKey::new(format!("priv-{id}")),
            notification_public_key: notification_key.map(str::to_string),
        }
    }

    #[test]
    fn test_file_name_for_id() {
        assert_eq!(file_name_for_id("conn-1"), "conn-1.json");
        assert_eq!(file_name_for_id("a_b.c"), "a_b.c.json");

        let hashed = file_name_for_id("../etc/passwd");
        assert_eq!(hashed.len(), 64 + ".json".len());
        assert!(!hashed.contains('/'));

        assert_ne!(file_name_for_id(".hidden"), ".hidden.json");
        assert_ne!(file_name_for_id(""), ".json");
        assert_ne!(file_name_for_id(&"x".repeat(200)), format!("{}.json", "x".repeat(200)));
    }

    #[tokio::test]
    async fn test_set_then_get_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsJsonPkiStore::open(dir.path(), false).unwrap();
            assert_eq!(store.get("conn-1").await.unwrap(), None);
            store.set(&record("conn-1", Some("N1"))).await.unwrap();
        }

        let reopened = FsJsonPkiStore::open(dir.path(), false).unwrap();
        let loaded = reopened.get("conn-1").await.unwrap().unwrap();
        assert_eq!(loaded, record("conn-1", Some("N1")));
    }

    #[tokio::test]
    async fn test_record_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsJsonPkiStore::open(dir.path(), false).unwrap();
        store.set(&record("conn-1", None)).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("conn-1.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["publicKey"], "pub-conn-1");
        assert!(!dir.path().join(".conn-1.json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("conn-1.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("conn-1.json"), "{not json").unwrap();

        let store = FsJsonPkiStore::open(dir.path(), false).unwrap();
        assert!(store.get("conn-1").await.is_err());
    }

    #[tokio::test]
    async fn test_hashed_identity_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsJsonPkiStore::open(dir.path(), false).unwrap();
        let id = "user@example.com/device 1";

        store.set(&record(id, None)).await.unwrap();
        assert!(dir.path().join(file_name_for_id(id)).exists());

        let reopened = FsJsonPkiStore::open(dir.path(), false).unwrap();
        assert_eq!(reopened.get(id).await.unwrap().unwrap().id, id);
    }
}
