//! # Key-Value Store
//!
//! Per-pack string storage used by workflow `kv_put` / `kv_get` steps.
//! Keys are namespaced by pack id so packs cannot observe each other's data.
//!
//! Two implementations:
//!
//! - [`MemoryKvStore`]: process-local, for tests and ephemeral runs.
//! - [`FileKvStore`]: one JSON document per pack under a directory, written
//!   atomically (temp file + rename).

use crate::constants::validate_pack_id;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage for workflow key-value steps.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, pack_id: &str, key: &str, value: &str) -> Result<()>;

    /// Returns `None` for an absent key.
    async fn get(&self, pack_id: &str, key: &str) -> Result<Option<String>>;

    /// Returns true if the key existed.
    async fn delete(&self, pack_id: &str, key: &str) -> Result<bool>;

    /// Keys stored for `pack_id`, sorted.
    async fn keys(&self, pack_id: &str) -> Result<Vec<String>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn put(&self, pack_id: &str, key: &str, value: &str) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        data.entry(pack_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, pack_id: &str, key: &str) -> Result<Option<String>> {
        let data = self
            .data
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(data.get(pack_id).and_then(|m| m.get(key)).cloned())
    }

    async fn delete(&self, pack_id: &str, key: &str) -> Result<bool> {
        let mut data = self
            .data
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(data
            .get_mut(pack_id)
            .is_some_and(|m| m.remove(key).is_some()))
    }

    async fn keys(&self, pack_id: &str) -> Result<Vec<String>> {
        let data = self
            .data
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(data
            .get(pack_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// File-backed store: `<dir>/<pack_id>.json`.
///
/// Writes are serialized by a single async lock; each write replaces the
/// pack's document atomically.
pub struct FileKvStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, pack_id: &str) -> Result<PathBuf> {
        validate_pack_id(pack_id).map_err(|reason| Error::PermissionDenied {
            pack_id: pack_id.to_string(),
            reason: format!("invalid pack id for key-value storage: {}", reason),
        })?;
        Ok(self.dir.join(format!("{}.json", pack_id)))
    }

    async fn load(&self, pack_id: &str) -> Result<BTreeMap<String, String>> {
        let path = self.path_for(pack_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, pack_id: &str, doc: &BTreeMap<String, String>) -> Result<()> {
        let path = self.path_for(pack_id)?;
        let temp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        tokio::fs::write(&temp, serde_json::to_vec(doc)?).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::StorageWriteFailed(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn put(&self, pack_id: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load(pack_id).await?;
        doc.insert(key.to_string(), value.to_string());
        self.save(pack_id, &doc).await?;
        debug!(pack_id = %pack_id, "Stored key {}", key);
        Ok(())
    }

    async fn get(&self, pack_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self.load(pack_id).await?.remove(key))
    }

    async fn delete(&self, pack_id: &str, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load(pack_id).await?;
        let existed = doc.remove(key).is_some();
        if existed {
            self.save(pack_id, &doc).await?;
        }
        Ok(existed)
    }

    async fn keys(&self, pack_id: &str) -> Result<Vec<String>> {
        Ok(self.load(pack_id).await?.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_isolates_packs() {
        let kv = MemoryKvStore::new();
        kv.put("a", "k", "1").await.unwrap();
        assert_eq!(kv.get("a", "k").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.get("b", "k").await.unwrap(), None);
        assert!(kv.delete("a", "k").await.unwrap());
        assert!(!kv.delete("a", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let temp = tempfile::TempDir::new().unwrap();
        let kv = FileKvStore::new(temp.path().to_path_buf()).unwrap();
        kv.put("pack", "b", "2").await.unwrap();
        kv.put("pack", "a", "1").await.unwrap();

        let reopened = FileKvStore::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(reopened.get("pack", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(reopened.keys("pack").await.unwrap(), vec!["a", "b"]);
        assert!(reopened.put("../x", "k", "v").await.is_err());
    }
}
