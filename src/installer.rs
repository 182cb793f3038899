//! # Pack Installer
//!
//! Turns a release artifact into an installed [`Pack`].
//!
//! ## Pipeline
//!
//! ```text
//! NameValidated ─► Downloading ─► ChecksumVerified ─► Extracted
//!       ─► ManifestValidated ─► EntryVerified ─► Relocated ─► Installed
//! ```
//!
//! - The filename is checked first, so a malformed name fails without any
//!   network traffic. A prod source without an expected checksum fails the
//!   same way.
//! - Everything between download and relocation happens inside a staging
//!   `TempDir` on the store volume. The directory is dropped on every exit
//!   path, so a failed install leaves nothing behind.
//! - The archive digest is always computed and recorded. It is compared
//!   against the expected value for prod installs and for dev installs that
//!   happen to supply one.
//! - Relocation goes through [`PackStore::commit`], which swaps the pack
//!   directory atomically under a per-id lock.
//!
//! ## Example
//!
//! ```rust,ignore
//! use packrun::{HttpFetcher, InstallSource, PackInstaller, PackStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(PackStore::new()?);
//! let installer = PackInstaller::new(store, Arc::new(HttpFetcher::new()?));
//! let result = installer
//!     .install(InstallSource::prod(
//!         "v1.2.3",
//!         "https://releases.example.com/pack-guard-android-v1.2.3.zip",
//!         "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
//!     ))
//!     .await?;
//! println!("installed {} at {}", result.pack.id, result.pack.install_path.display());
//! ```

use crate::archive;
use crate::checksum;
use crate::constants::{MANIFEST_FILE, MAX_ARCHIVE_SIZE};
use crate::error::{Error, Result};
use crate::manifest::PackManifest;
use crate::pack::{InstallSource, Pack};
use crate::pack_name::{PackName, filename_from_url};
use crate::remote::ArtifactFetcher;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::PackStore;
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Stages of an install, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    NameValidated,
    Downloading,
    ChecksumVerified,
    Extracted,
    ManifestValidated,
    EntryVerified,
    Relocated,
    Installed,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NameValidated => "name-validated",
            Self::Downloading => "downloading",
            Self::ChecksumVerified => "checksum-verified",
            Self::Extracted => "extracted",
            Self::ManifestValidated => "manifest-validated",
            Self::EntryVerified => "entry-verified",
            Self::Relocated => "relocated",
            Self::Installed => "installed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub pack: Pack,
    pub manifest: PackManifest,
    /// Lowercase hex SHA-256 of the archive.
    pub checksum: String,
}

/// Downloads, verifies and installs packs into a [`PackStore`].
pub struct PackInstaller {
    store: Arc<PackStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    bearer_token: Option<String>,
    max_archive_size: u64,
    retry: RetryPolicy,
}

impl PackInstaller {
    pub fn new(store: Arc<PackStore>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            store,
            fetcher,
            bearer_token: None,
            max_archive_size: MAX_ARCHIVE_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    /// Sends `token` as a bearer credential on downloads.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Overrides the download size bound.
    pub fn with_max_archive_size(mut self, bytes: u64) -> Self {
        self.max_archive_size = bytes;
        self
    }

    /// Overrides how transient download failures are retried.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn store(&self) -> &Arc<PackStore> {
        &self.store
    }

    /// Installs the artifact named by `source`.
    pub async fn install(&self, source: InstallSource) -> Result<InstallResult> {
        let url = source.url().to_string();
        let filename = filename_from_url(&url).to_string();
        preflight(&filename, &source)?;

        let staging = self.staging()?;
        let archive_path = staging.path().join(&filename);

        info!(file = %filename, stage = %InstallStage::Downloading, "Downloading {}", url);
        retry_with_backoff(&self.retry, "download", || {
            self.fetcher.fetch(
                &url,
                self.bearer_token.as_deref(),
                &archive_path,
                self.max_archive_size,
            )
        })
        .await?;

        self.install_staged(staging, &archive_path, &filename, source)
            .await
    }

    /// Installs a local archive. Same pipeline as [`install`](Self::install)
    /// without the download.
    pub async fn install_from_file(
        &self,
        path: &Path,
        source: InstallSource,
    ) -> Result<InstallResult> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        preflight(&filename, &source)?;

        let meta = std::fs::metadata(path)?;
        if meta.len() > self.max_archive_size {
            return Err(Error::ArchiveTooLarge(format!(
                "{} is {} bytes > {}",
                filename,
                meta.len(),
                self.max_archive_size
            )));
        }

        let staging = self.staging()?;
        self.install_staged(staging, path, &filename, source).await
    }

    /// Removes an installed pack.
    pub async fn uninstall(&self, pack_id: &str) -> Result<()> {
        self.store.remove(pack_id).await
    }

    pub fn list(&self) -> Result<Vec<Pack>> {
        self.store.list()
    }

    pub fn get(&self, pack_id: &str) -> Result<Pack> {
        self.store.get(pack_id)
    }

    fn staging(&self) -> Result<TempDir> {
        TempDir::new_in(self.store.staging_dir()).map_err(|e| {
            Error::StorageWriteFailed(format!("failed to create staging directory: {}", e))
        })
    }

    /// Runs every stage after the archive is on disk. `staging` is dropped
    /// when this returns, whatever the outcome.
    async fn install_staged(
        &self,
        staging: TempDir,
        archive_path: &Path,
        filename: &str,
        source: InstallSource,
    ) -> Result<InstallResult> {
        let checksum = {
            let path = archive_path.to_path_buf();
            blocking(move || checksum::digest_file(&path)).await?
        };

        match source.expected_checksum() {
            Some(expected) if !checksum::digests_match(&checksum, expected) => {
                warn!(file = %filename, "Checksum mismatch: expected {}, computed {}", expected, checksum);
                return Err(Error::ChecksumMismatch {
                    artifact: filename.to_string(),
                    expected: expected.to_string(),
                    actual: checksum,
                });
            }
            Some(_) => {
                info!(file = %filename, stage = %InstallStage::ChecksumVerified, "Checksum verified: {}", checksum);
            }
            None => debug!(file = %filename, "No expected checksum, computed {}", checksum),
        }

        let extracted = staging.path().join("extracted");
        let summary = {
            let archive_path = archive_path.to_path_buf();
            let extracted = extracted.clone();
            blocking(move || archive::extract(&archive_path, &extracted)).await?
        };
        info!(
            file = %filename,
            stage = %InstallStage::Extracted,
            "Extracted {} files ({} bytes)",
            summary.files,
            summary.total_bytes
        );

        let manifest_path = extracted.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::ManifestMissing);
        }
        let manifest = PackManifest::from_file(&manifest_path)?;
        info!(
            pack_id = %manifest.id,
            stage = %InstallStage::ManifestValidated,
            "Manifest valid: {} {} ({})",
            manifest.name,
            manifest.version,
            manifest.pack_type
        );

        let entry_path: PathBuf = extracted.join(&manifest.entry);
        let entry_is_file = std::fs::symlink_metadata(&entry_path)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        if !entry_is_file {
            return Err(Error::EntryMissing {
                entry: manifest.entry.clone(),
            });
        }
        debug!(pack_id = %manifest.id, stage = %InstallStage::EntryVerified, "Entry {} present", manifest.entry);

        let pack = self
            .store
            .commit(&manifest.id, &extracted, |install_path| Pack {
                id: manifest.id.clone(),
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                pack_type: manifest.pack_type,
                manifest: manifest.clone(),
                source,
                install_path,
                checksum: checksum.clone(),
                installed_at: Utc::now(),
            })
            .await?;
        debug!(pack_id = %pack.id, stage = %InstallStage::Relocated, "Relocated");

        info!(
            pack_id = %pack.id,
            stage = %InstallStage::Installed,
            "Installed {} {} at {}",
            pack.name,
            pack.version,
            pack.install_path.display()
        );

        drop(staging);

        Ok(InstallResult {
            pack,
            manifest,
            checksum,
        })
    }
}

/// Checks that need neither network nor disk.
fn preflight(filename: &str, source: &InstallSource) -> Result<()> {
    if PackName::parse(filename).is_none() {
        return Err(Error::InvalidPackFilename {
            filename: filename.to_string(),
            reason: "expected pack-<variant>-<target>-<version>.zip".to_string(),
        });
    }
    debug!(file = %filename, stage = %InstallStage::NameValidated, "Filename accepted");

    if source.is_prod()
        && source
            .expected_checksum()
            .is_none_or(|c| c.trim().is_empty())
    {
        return Err(Error::ChecksumRequired {
            url: source.url().to_string(),
        });
    }

    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}
