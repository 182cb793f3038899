//! Installed pack records and install provenance.

use crate::manifest::{PackManifest, PackType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a pack came from.
///
/// Dev installs trust an arbitrary source ref. Prod installs come from a
/// tagged release and always carry a verified checksum; the installer
/// rejects a prod source without one rather than treating it as dev.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallSource {
    Dev {
        /// Branch or commit the artifact was built from.
        source_ref: String,
        url: String,
    },
    Prod {
        /// Release tag.
        tag: String,
        url: String,
        /// Expected SHA-256 of the archive, hex.
        checksum: Option<String>,
    },
}

impl InstallSource {
    /// Creates a dev source.
    pub fn dev(source_ref: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Dev {
            source_ref: source_ref.into(),
            url: url.into(),
        }
    }

    /// Creates a prod source with an expected checksum.
    pub fn prod(tag: impl Into<String>, url: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self::Prod {
            tag: tag.into(),
            url: url.into(),
            checksum: Some(checksum.into()),
        }
    }

    /// Artifact URL.
    pub fn url(&self) -> &str {
        match self {
            Self::Dev { url, .. } | Self::Prod { url, .. } => url,
        }
    }

    /// Returns true for prod sources.
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod { .. })
    }

    /// Expected checksum, if one was supplied.
    pub fn expected_checksum(&self) -> Option<&str> {
        match self {
            Self::Prod { checksum, .. } => checksum.as_deref(),
            Self::Dev { .. } => None,
        }
    }
}

/// An installed pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    pub id: String,
    pub name: String,
    pub version: String,
    pub pack_type: PackType,
    pub manifest: PackManifest,
    pub source: InstallSource,
    pub install_path: PathBuf,
    /// Lowercase hex SHA-256 of the original archive.
    pub checksum: String,
    pub installed_at: DateTime<Utc>,
}

impl Pack {
    /// Absolute path to the manifest entry file.
    pub fn entry_path(&self) -> PathBuf {
        self.install_path.join(&self.manifest.entry)
    }

    /// Root directory for the pack's filesystem grants.
    pub fn data_dir(&self) -> PathBuf {
        self.install_path.join(crate::constants::PACK_DATA_DIR)
    }
}
