//! # Permission Enforcement
//!
//! Execution-time checks of the capabilities a manifest requests. These run
//! again right before every execution, independent of install-time manifest
//! validation: a record on disk may have been edited since it was installed.
//!
//! ## Filesystem Grants
//!
//! Grants are globs relative to the pack's `data/` directory. The sandbox
//! cannot evaluate globs, so each grant is reduced to its **static prefix**
//! (the leading components without wildcard characters) and that directory
//! is preopened:
//!
//! | grant            | preopened directory |
//! |------------------|---------------------|
//! | `config/*.json`  | `data/config`       |
//! | `cache/**`       | `data/cache`        |
//! | `*.txt`          | `data`              |
//! | `settings.json`  | `data` (parent of a literal file) |
//!
//! Write grants are preopened read+write, read grants read-only. When both
//! name the same directory, read+write wins.
//!
//! ## Network Grants
//!
//! [`network_allows`] matches a URL against the declared connect URLs by
//! scheme, host, port and path prefix. A host that is not declared is never
//! reachable, localhost included.

use crate::error::{Error, Result};
use crate::manifest::{Permissions, relative_path_violation, url_violation};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Characters that start a glob pattern.
const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// Re-validates every declared capability.
///
/// Fails with [`Error::PermissionDenied`] naming the offending grant.
pub fn enforce(pack_id: &str, permissions: &Permissions) -> Result<()> {
    let deny = |reason: String| Error::PermissionDenied {
        pack_id: pack_id.to_string(),
        reason,
    };

    let fs = &permissions.filesystem;
    for (kind, paths) in [("read", &fs.read), ("write", &fs.write)] {
        for path in paths {
            if let Some(reason) = relative_path_violation(path) {
                return Err(deny(format!("filesystem {} path '{}' {}", kind, path, reason)));
            }
        }
    }

    for url in &permissions.network.connect {
        if let Some(reason) = url_violation(url) {
            return Err(deny(format!("network URL '{}' {}", url, reason)));
        }
    }

    debug!(
        pack_id = %pack_id,
        "Permissions enforced: {} read, {} write, {} connect",
        fs.read.len(),
        fs.write.len(),
        permissions.network.connect.len()
    );
    Ok(())
}

/// Returns true if `url` falls under one of the declared connect URLs.
pub fn network_allows(permissions: &Permissions, url: &str) -> bool {
    let Ok(target) = Url::parse(url) else {
        return false;
    };
    if !matches!(target.scheme(), "http" | "https") {
        return false;
    }

    let allowed = permissions.network.connect.iter().any(|declared| {
        Url::parse(declared.trim()).is_ok_and(|allowed| url_matches(&allowed, &target))
    });

    if !allowed && target.host_str().is_some_and(is_localhost) {
        debug!("Blocked undeclared localhost URL {}", url);
    }
    allowed
}

fn url_matches(allowed: &Url, target: &Url) -> bool {
    if allowed.scheme() != target.scheme()
        || allowed.host_str() != target.host_str()
        || allowed.port_or_known_default() != target.port_or_known_default()
    {
        return false;
    }

    let prefix = allowed.path();
    let path = target.path();
    prefix == "/"
        || path == prefix
        || (prefix.ends_with('/') && path.starts_with(prefix))
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Returns true if `host` names the local machine.
pub fn is_localhost(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Leading components of a glob that contain no wildcard characters.
///
/// Returns the prefix and whether the whole pattern was literal.
pub fn static_prefix(glob: &str) -> (PathBuf, bool) {
    let unified = glob.replace('\\', "/");
    let mut prefix = PathBuf::new();
    for segment in unified.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment.contains(GLOB_CHARS) {
            return (prefix, false);
        }
        prefix.push(segment);
    }
    (prefix, true)
}

/// A directory to expose to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preopen {
    /// Host directory, inside the pack data directory.
    pub host: PathBuf,
    /// Guest-visible path.
    pub guest: String,
    pub writable: bool,
}

/// Maps filesystem grants onto directories under `data_dir`.
///
/// Directories behind write grants are created if missing; read grants on
/// missing directories are skipped. Every host directory is canonicalized
/// and must stay inside `data_dir`, so a symlink planted in the data
/// directory cannot widen a grant.
pub fn plan_preopens(pack_id: &str, data_dir: &Path, permissions: &Permissions) -> Result<Vec<Preopen>> {
    enforce(pack_id, permissions)?;

    let fs_perms = &permissions.filesystem;
    if fs_perms.read.is_empty() && fs_perms.write.is_empty() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(data_dir)?;
    let root = fs::canonicalize(data_dir)?;

    // relative dir -> writable
    let mut dirs: BTreeMap<PathBuf, bool> = BTreeMap::new();
    let grants = fs_perms
        .read
        .iter()
        .map(|g| (g, false))
        .chain(fs_perms.write.iter().map(|g| (g, true)));

    for (glob, writable) in grants {
        let (prefix, literal) = static_prefix(glob);
        let host = root.join(&prefix);
        let dir = if literal && !host.is_dir() {
            if host.exists() || !writable {
                // A literal file: expose its parent.
                prefix.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                prefix
            }
        } else {
            prefix
        };

        let entry = dirs.entry(dir).or_insert(false);
        *entry |= writable;
    }

    let mut preopens = Vec::with_capacity(dirs.len());
    for (relative, writable) in dirs {
        let host = root.join(&relative);
        if !host.is_dir() {
            if writable {
                fs::create_dir_all(&host)?;
            } else {
                debug!(pack_id = %pack_id, "Skipping missing read-only directory {}", host.display());
                continue;
            }
        }

        let canonical = fs::canonicalize(&host)?;
        if !canonical.starts_with(&root) {
            return Err(Error::PermissionDenied {
                pack_id: pack_id.to_string(),
                reason: format!("grant '{}' resolves outside the data directory", relative.display()),
            });
        }

        let guest = if relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            relative.to_string_lossy().replace('\\', "/")
        };

        preopens.push(Preopen {
            host: canonical,
            guest,
            writable,
        });
    }

    Ok(preopens)
}
