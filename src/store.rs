//! # Pack Store
//!
//! Durable home of installed packs, keyed by manifest id.
//!
//! ## Layout
//!
//! ```text
//! ~/.packrun/store/
//! ├── packs/
//! │   └── <pack-id>/        (extracted tree: pack.json, entry, data/)
//! ├── records/
//! │   └── <pack-id>.json    (persisted Pack record)
//! └── .staging/             (install scratch space, same volume)
//! ```
//!
//! ## Atomic Relocation
//!
//! [`PackStore::commit`] is the only operation that mutates `packs/`. It:
//!
//! 1. Writes the new record to `records/<id>.tmp.<uuid>`.
//! 2. Moves the staged tree to `.staging/incoming-<uuid>` (rename; falls back
//!    to a recursive copy when the staged tree sits on another volume).
//! 3. Renames any existing `packs/<id>` to `.staging/previous-<uuid>`.
//! 4. Renames the incoming tree to `packs/<id>`.
//! 5. Renames the temp record over `records/<id>.json`.
//! 6. Removes the previous tree.
//!
//! A failure in steps 4 or 5 puts the previous tree back and discards the
//! temp record. Every step that touches `packs/<id>` or the record is a
//! same-volume rename, so directory and record always come from the same
//! install. Commits for the same pack id are serialized by a per-id async lock;
//! different ids proceed in parallel.

use crate::constants::{PACK_RECORDS_DIR, PACK_STAGING_DIR, validate_pack_id};
use crate::error::{Error, Result};
use crate::pack::Pack;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Subdirectory holding extracted pack trees.
const PACKS_DIR: &str = "packs";

/// On-disk pack store.
///
/// ## Thread Safety
///
/// `PackStore` is `Send + Sync`. Mutations of a given pack id are serialized
/// through [`PackStore::lock`].
pub struct PackStore {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PackStore {
    /// Creates a store at the default location.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a store rooted at `base_dir`.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        for dir in [
            base_dir.join(PACKS_DIR),
            base_dir.join(PACK_RECORDS_DIR),
            base_dir.join(PACK_STAGING_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }

        info!("Pack store initialized at: {}", base_dir.display());

        Ok(Self {
            base_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the default store path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".packrun").join("store"))
            .unwrap_or_else(|| PathBuf::from(".packrun").join("store"))
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Scratch directory on the store volume.
    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join(PACK_STAGING_DIR)
    }

    /// Directory of an installed pack.
    ///
    /// # Security
    ///
    /// The id is validated so it cannot address anything outside `packs/`.
    pub fn pack_dir(&self, id: &str) -> Result<PathBuf> {
        Self::check_id(id)?;
        Ok(self.base_dir.join(PACKS_DIR).join(id))
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        Self::check_id(id)?;
        Ok(self
            .base_dir
            .join(PACK_RECORDS_DIR)
            .join(format!("{}.json", id)))
    }

    fn check_id(id: &str) -> Result<()> {
        validate_pack_id(id).map_err(|reason| Error::manifest("id", format!("'{}' {}", id, reason)))
    }

    /// Returns the exclusive lock for mutations of `id`.
    pub fn lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Atomically replaces `packs/<id>` with the tree at `staged` and
    /// persists the record built by `make_record` from the final path.
    ///
    /// Both happen under the per-id lock, so concurrent commits of the same
    /// id leave a directory and record from the same install. If the record
    /// cannot be put in place, the previous tree and record are kept.
    /// `staged` is moved (or copied, across volumes) and must not be reused.
    pub async fn commit<F>(&self, id: &str, staged: &Path, make_record: F) -> Result<Pack>
    where
        F: FnOnce(PathBuf) -> Pack,
    {
        let target = self.pack_dir(id)?;
        let record = self.record_path(id)?;
        let lock = self.lock(id);
        let _guard = lock.lock().await;

        let pack = make_record(target.clone());
        let json = serde_json::to_vec_pretty(&pack)?;

        let staged = staged.to_path_buf();
        let scratch = self.staging_dir();
        let target_clone = target.clone();
        tokio::task::spawn_blocking(move || {
            install_tree(&staged, &target_clone, &scratch, &record, &json)
        })
        .await
        .map_err(|e| Error::Internal(format!("relocation task failed: {}", e)))??;

        info!(pack_id = %id, "Relocated pack into {}", target.display());
        Ok(pack)
    }

    /// Loads a pack record.
    pub fn get(&self, id: &str) -> Result<Pack> {
        let path = self.record_path(id)?;
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::PackNotFound(id.to_string()),
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Returns true if a record exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.record_path(id).is_ok_and(|p| p.exists())
    }

    /// Lists all installed packs, sorted by id. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<Pack>> {
        let mut packs = Vec::new();
        for entry in fs::read_dir(self.base_dir.join(PACK_RECORDS_DIR))? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|b| serde_json::from_slice::<Pack>(&b).map_err(Error::from))
            {
                Ok(pack) => packs.push(pack),
                Err(e) => warn!("Skipping unreadable pack record {}: {}", path.display(), e),
            }
        }
        packs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(packs)
    }

    /// Removes the record and the directory of a pack.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.pack_dir(id)?;
        let record = self.record_path(id)?;
        let lock = self.lock(id);
        let _guard = lock.lock().await;

        if !record.exists() && !dir.exists() {
            return Err(Error::PackNotFound(id.to_string()));
        }

        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        if record.exists() {
            fs::remove_file(&record).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        info!(pack_id = %id, "Removed pack");
        Ok(())
    }
}

/// Puts the tree at `staged` and the record `json` in place together.
fn install_tree(
    staged: &Path,
    target: &Path,
    scratch: &Path,
    record: &Path,
    json: &[u8],
) -> Result<()> {
    let temp = record.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp, json).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

    let previous = match swap_dir(staged, target, scratch) {
        Ok(previous) => previous,
        Err(e) => {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&temp, record) {
        let _ = fs::remove_file(&temp);
        restore_dir(target, previous.as_deref(), scratch);
        return Err(Error::StorageWriteFailed(format!(
            "failed to write record {}: {}",
            record.display(),
            e
        )));
    }
    debug!("Saved pack record {}", record.display());

    if let Some(previous) = previous
        && let Err(e) = fs::remove_dir_all(&previous)
    {
        warn!("Failed to remove replaced tree {}: {}", previous.display(), e);
    }
    Ok(())
}

/// Puts `previous` (or nothing) back at `target` after a failed commit.
fn restore_dir(target: &Path, previous: Option<&Path>, scratch: &Path) {
    let failed = scratch.join(format!("failed-{}", uuid::Uuid::now_v7()));
    if let Err(e) = fs::rename(target, &failed) {
        warn!("Failed to move aside new tree {}: {}", target.display(), e);
        return;
    }
    if let Some(previous) = previous
        && let Err(e) = fs::rename(previous, target)
    {
        warn!("Failed to restore previous tree {}: {}", target.display(), e);
    }
    let _ = fs::remove_dir_all(&failed);
}

/// Swaps `target` for the tree at `staged` using same-volume renames.
/// Returns where the replaced tree was moved; the caller disposes of it.
fn swap_dir(staged: &Path, target: &Path, scratch: &Path) -> Result<Option<PathBuf>> {
    let incoming = scratch.join(format!("incoming-{}", uuid::Uuid::now_v7()));

    match fs::rename(staged, &incoming) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("Staged tree on another volume, copying into store");
            if let Err(e) = copy_tree(staged, &incoming) {
                let _ = fs::remove_dir_all(&incoming);
                return Err(Error::StorageWriteFailed(format!(
                    "copy into store failed: {}",
                    e
                )));
            }
        }
        Err(e) => {
            return Err(Error::StorageWriteFailed(format!(
                "failed to stage {}: {}",
                staged.display(),
                e
            )));
        }
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    }

    let previous = scratch.join(format!("previous-{}", uuid::Uuid::now_v7()));
    let had_previous = target.exists();
    if had_previous && let Err(e) = fs::rename(target, &previous) {
        let _ = fs::remove_dir_all(&incoming);
        return Err(Error::StorageWriteFailed(format!(
            "failed to move aside {}: {}",
            target.display(),
            e
        )));
    }

    if let Err(e) = fs::rename(&incoming, target) {
        if had_previous && let Err(restore) = fs::rename(&previous, target) {
            warn!(
                "Failed to restore previous tree {}: {}",
                target.display(),
                restore
            );
        }
        let _ = fs::remove_dir_all(&incoming);
        return Err(Error::StorageWriteFailed(format!(
            "failed to move {} into place: {}",
            target.display(),
            e
        )));
    }

    Ok(had_previous.then_some(previous))
}

/// Recursively copies a directory tree. Symlinks are not followed.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged_tree(root: &Path, marker: &str) -> PathBuf {
        let dir = root.join(format!("tree-{}", marker));
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("pack.json"), marker).unwrap();
        fs::write(dir.join("nested").join("file"), marker).unwrap();
        dir
    }

    #[test]
    fn test_install_tree_installs_and_replaces() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let target = temp.path().join("packs").join("demo");
        let record = temp.path().join("demo.json");

        install_tree(&staged_tree(temp.path(), "v1"), &target, &scratch, &record, b"r1").unwrap();
        assert_eq!(fs::read_to_string(target.join("pack.json")).unwrap(), "v1");
        assert_eq!(fs::read_to_string(&record).unwrap(), "r1");

        install_tree(&staged_tree(temp.path(), "v2"), &target, &scratch, &record, b"r2").unwrap();
        assert_eq!(fs::read_to_string(&record).unwrap(), "r2");
        assert_eq!(fs::read_to_string(target.join("pack.json")).unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(target.join("nested").join("file")).unwrap(),
            "v2"
        );
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_record_write_keeps_previous_install() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let target = temp.path().join("packs").join("demo");
        let records = temp.path().join("records");
        fs::create_dir_all(&records).unwrap();
        let record = records.join("demo.json");

        install_tree(&staged_tree(temp.path(), "v1"), &target, &scratch, &record, b"r1").unwrap();

        // A non-empty directory where the record goes makes its rename fail.
        fs::remove_file(&record).unwrap();
        fs::create_dir_all(record.join("blocker")).unwrap();

        let err = install_tree(&staged_tree(temp.path(), "v2"), &target, &scratch, &record, b"r2")
            .unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        assert_eq!(fs::read_to_string(target.join("pack.json")).unwrap(), "v1");
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&records).unwrap().count(), 1);
    }

    #[test]
    fn test_first_install_is_undone_when_record_fails() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let target = temp.path().join("packs").join("demo");
        let record = temp.path().join("demo.json");
        fs::create_dir_all(record.join("blocker")).unwrap();

        assert!(
            install_tree(&staged_tree(temp.path(), "v1"), &target, &scratch, &record, b"r1")
                .is_err()
        );
        assert!(!target.exists());
    }

    #[test]
    fn test_copy_tree() {
        let temp = TempDir::new().unwrap();
        let src = staged_tree(temp.path(), "copy");
        let dest = temp.path().join("dest");
        copy_tree(&src, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("nested").join("file")).unwrap(),
            "copy"
        );
    }

    #[test]
    fn test_pack_dir_rejects_traversal_ids() {
        let temp = TempDir::new().unwrap();
        let store = PackStore::with_path(temp.path().to_path_buf()).unwrap();
        assert!(store.pack_dir("../escape").is_err());
        assert!(store.pack_dir("ok-id").is_ok());
    }
}
