//! Persistence of instance rows.
//!
//! The manager only depends on [`InstanceRepository`]. Two implementations
//! ship with the crate: an in-memory map and a JSON document written
//! atomically after every change.

use super::state::Instance;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage for instance rows.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Inserts a new Stopped row with the next id.
    async fn create(&self, pack_id: &str, name: &str) -> Result<Instance>;

    async fn get(&self, id: u64) -> Result<Option<Instance>>;

    /// Replaces an existing row. Fails with [`Error::InstanceNotFound`] if
    /// the row was deleted.
    async fn save(&self, instance: &Instance) -> Result<()>;

    /// Returns true if a row was removed.
    async fn delete(&self, id: u64) -> Result<bool>;

    /// All rows ordered by id.
    async fn list(&self) -> Result<Vec<Instance>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct InstanceTable {
    next_id: u64,
    instances: BTreeMap<u64, Instance>,
}

impl InstanceTable {
    fn create(&mut self, pack_id: &str, name: &str) -> Instance {
        self.next_id += 1;
        let instance = Instance::new(self.next_id, pack_id, name);
        self.instances.insert(instance.id, instance.clone());
        instance
    }

    fn save(&mut self, instance: &Instance) -> Result<()> {
        match self.instances.get_mut(&instance.id) {
            Some(row) => {
                *row = instance.clone();
                Ok(())
            }
            None => Err(Error::InstanceNotFound(instance.id)),
        }
    }
}

/// In-memory repository.
#[derive(Debug, Default)]
pub struct MemoryInstanceRepository {
    table: RwLock<InstanceTable>,
}

impl MemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceRepository {
    async fn create(&self, pack_id: &str, name: &str) -> Result<Instance> {
        let mut table = self
            .table
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(table.create(pack_id, name))
    }

    async fn get(&self, id: u64) -> Result<Option<Instance>> {
        let table = self
            .table
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(table.instances.get(&id).cloned())
    }

    async fn save(&self, instance: &Instance) -> Result<()> {
        let mut table = self
            .table
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        table.save(instance)
    }

    async fn delete(&self, id: u64) -> Result<bool> {
        let mut table = self
            .table
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(table.instances.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let table = self
            .table
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(table.instances.values().cloned().collect())
    }
}

/// Repository persisted as a single JSON document.
///
/// The document also stores the id counter, so ids stay monotonic across
/// restarts even after rows are deleted.
pub struct JsonInstanceRepository {
    path: PathBuf,
    table: Mutex<InstanceTable>,
}

impl JsonInstanceRepository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageInitFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let table = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => InstanceTable::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened instance repository at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            table: Mutex::new(table),
        })
    }

    async fn persist(&self, table: &InstanceTable) -> Result<()> {
        let temp = self
            .path
            .with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        tokio::fs::write(&temp, serde_json::to_vec_pretty(table)?).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::StorageWriteFailed(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for JsonInstanceRepository {
    async fn create(&self, pack_id: &str, name: &str) -> Result<Instance> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let instance = next.create(pack_id, name);
        self.persist(&next).await?;
        *table = next;
        Ok(instance)
    }

    async fn get(&self, id: u64) -> Result<Option<Instance>> {
        Ok(self.table.lock().await.instances.get(&id).cloned())
    }

    async fn save(&self, instance: &Instance) -> Result<()> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        next.save(instance)?;
        self.persist(&next).await?;
        *table = next;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<bool> {
        let mut table = self.table.lock().await;
        if !table.instances.contains_key(&id) {
            return Ok(false);
        }
        let mut next = table.clone();
        next.instances.remove(&id);
        self.persist(&next).await?;
        *table = next;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.table.lock().await.instances.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let repo = MemoryInstanceRepository::new();
        let a = repo.create("p", "a").await.unwrap();
        let b = repo.create("p", "b").await.unwrap();
        assert!(b.id > a.id);
        assert!(repo.delete(a.id).await.unwrap());
        let c = repo.create("p", "c").await.unwrap();
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn test_json_repository_reopens() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("instances.json");
        let id = {
            let repo = JsonInstanceRepository::open(&path).unwrap();
            repo.create("pack", "first").await.unwrap().id
        };
        let repo = JsonInstanceRepository::open(&path).unwrap();
        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "first");
        assert!(repo.create("pack", "second").await.unwrap().id > id);
    }

    #[tokio::test]
    async fn test_save_of_deleted_row_fails() {
        let repo = MemoryInstanceRepository::new();
        let row = repo.create("p", "a").await.unwrap();
        repo.delete(row.id).await.unwrap();
        assert!(matches!(
            repo.save(&row).await,
            Err(Error::InstanceNotFound(_))
        ));
    }
}
