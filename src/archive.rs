//! # Safe Archive Extraction
//!
//! Extracts pack archives (zip) into a directory with per-entry zip-slip
//! protection.
//!
//! ## Security Model
//!
//! Every entry is checked twice before anything is written:
//!
//! 1. **Lexical**: the raw entry name is rejected if it is absolute, carries
//!    a drive or root component, contains NUL, or climbs above the
//!    destination after `..` resolution.
//! 2. **Canonical**: the entry's parent directory is created and then
//!    canonicalized; the result must be a descendant of the canonical
//!    destination. This catches escapes through pre-existing symlinks that
//!    a lexical check cannot see.
//!
//! Symlink entries are never materialized. A symlink whose target resolves
//! outside the destination fails with [`Error::PathTraversal`]; in-tree
//! symlinks are skipped.
//!
//! Size limits bound the damage of zip bombs: [`MAX_ARCHIVE_ENTRIES`] and
//! [`MAX_EXTRACTED_SIZE`].
//!
//! Extraction is not transactional. On error the destination may hold a
//! partial tree; the caller owns the directory and discards it (the
//! installer extracts into a `TempDir`).

use crate::constants::{MAX_ARCHIVE_ENTRIES, MAX_EXTRACTED_SIZE};
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

/// Counters reported by [`extract`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Regular files written.
    pub files: usize,
    /// Directories created.
    pub directories: usize,
    /// Uncompressed bytes written.
    pub total_bytes: u64,
    /// In-tree symlink entries that were skipped.
    pub skipped_symlinks: usize,
}

/// Extracts `archive_path` into `dest_dir`.
///
/// `dest_dir` is created if missing. Any failing entry aborts the whole
/// extraction.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<ExtractionSummary> {
    let file = File::open(archive_path).map_err(|e| Error::ArchiveFailed {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut archive = ZipArchive::new(file).map_err(|e| Error::ArchiveFailed {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if archive.len() > MAX_ARCHIVE_ENTRIES {
        return Err(Error::ArchiveTooLarge(format!(
            "{} entries > {}",
            archive.len(),
            MAX_ARCHIVE_ENTRIES
        )));
    }

    fs::create_dir_all(dest_dir)?;
    let root = fs::canonicalize(dest_dir)?;

    let mut summary = ExtractionSummary::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| Error::ArchiveFailed {
            path: archive_path.to_path_buf(),
            reason: format!("entry {}: {}", index, e),
        })?;

        let name = entry.name().to_string();
        let relative = sanitize_entry_name(&name)?;

        if relative.as_os_str().is_empty() {
            // Entry naming the archive root itself, e.g. "./"
            continue;
        }

        let target = root.join(&relative);

        if entry.is_symlink() {
            let mut link_target = String::new();
            entry
                .read_to_string(&mut link_target)
                .map_err(|e| Error::ArchiveFailed {
                    path: archive_path.to_path_buf(),
                    reason: format!("symlink {}: {}", name, e),
                })?;
            check_symlink_target(&relative, &link_target, &name)?;
            warn!("Skipping in-tree symlink entry {} -> {}", name, link_target);
            summary.skipped_symlinks += 1;
            continue;
        }

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            ensure_within(&root, &target, &name)?;
            summary.directories += 1;
            continue;
        }

        let parent = target.parent().unwrap_or(&root);
        fs::create_dir_all(parent)?;
        ensure_within(&root, parent, &name)?;

        // A pre-existing symlink at the target would redirect the write.
        if let Ok(meta) = fs::symlink_metadata(&target)
            && meta.file_type().is_symlink()
        {
            return Err(Error::PathTraversal { path: name });
        }

        let remaining = MAX_EXTRACTED_SIZE.saturating_sub(summary.total_bytes);
        if entry.size() > remaining {
            return Err(Error::ArchiveTooLarge(format!(
                "extracted size exceeds {} bytes at entry {}",
                MAX_EXTRACTED_SIZE, name
            )));
        }

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)?;

        // Declared sizes can lie; bound the actual copy as well.
        let written = io::copy(&mut (&mut entry).take(remaining + 1), &mut out)?;
        if written > remaining {
            return Err(Error::ArchiveTooLarge(format!(
                "extracted size exceeds {} bytes at entry {}",
                MAX_EXTRACTED_SIZE, name
            )));
        }

        summary.total_bytes += written;
        summary.files += 1;
        debug!("Extracted {} ({} bytes)", name, written);
    }

    Ok(summary)
}

/// Converts a raw entry name into a normalized relative path.
///
/// Fails with [`Error::PathTraversal`] for absolute names, drive/root
/// components, NUL bytes, or `..` climbing above the root.
pub fn sanitize_entry_name(name: &str) -> Result<PathBuf> {
    let traversal = || Error::PathTraversal {
        path: name.to_string(),
    };

    if name.contains('\0') {
        return Err(traversal());
    }

    // Zip names written on Windows may use backslashes.
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(traversal());
    }

    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }

    // "C:foo" is a plain component on Unix but a drive path on Windows.
    if out
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .is_some_and(|first| first.len() >= 2 && first.as_bytes()[1] == b':')
    {
        return Err(traversal());
    }

    Ok(out)
}

/// Rejects a symlink entry whose target resolves outside the root.
fn check_symlink_target(entry: &Path, link_target: &str, name: &str) -> Result<()> {
    let traversal = || Error::PathTraversal {
        path: format!("{} -> {}", name, link_target),
    };

    let link_target = link_target.replace('\\', "/");
    if link_target.starts_with('/') {
        return Err(traversal());
    }

    let base = entry.parent().unwrap_or(Path::new(""));
    let joined = base.join(&link_target);
    let joined = joined.to_string_lossy();
    sanitize_entry_name(&joined).map_err(|_| traversal())?;
    Ok(())
}

/// Verifies that `path` canonicalizes to a descendant of `root`.
fn ensure_within(root: &Path, path: &Path, name: &str) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !canonical.starts_with(root) {
        return Err(Error::PathTraversal {
            path: name.to_string(),
        });
    }
    Ok(())
}
