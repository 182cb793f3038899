//! # Pack Manifest
//!
//! Types and validation for `pack.json`, the descriptor at the root of every
//! pack archive.
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "id": "guard",
//!   "name": "Guard",
//!   "version": "1.2.3",
//!   "type": "wasm",
//!   "entry": "main.wasm",
//!   "permissions": {
//!     "filesystem": { "read": ["config/*"], "write": ["cache/**"] },
//!     "network": { "connect": ["https://api.example.com/"], "allow_localhost_listen": false }
//!   },
//!   "limits": { "memory_mb": 64, "cpu_ms_per_sec": 100 },
//!   "required_env": ["API_TOKEN"],
//!   "build": { "git_sha": "abc123", "build_time": "2026-01-01T00:00:00Z", "target": "wasm32-wasip1" }
//! }
//! ```
//!
//! Validation is a pure function. Rules run in a fixed order and the first
//! violation wins; the error names the offending field and value. Values
//! are never coerced into something valid.

use crate::constants::{
    CPU_WINDOW_MS, MANIFEST_SCHEMA_VERSION, MAX_MEMORY_MB, validate_pack_id,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Kind of code a pack carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    /// A WebAssembly module run in the sandbox.
    #[serde(alias = "WASM", alias = "Wasm")]
    Wasm,
    /// A declarative workflow interpreted by the workflow engine.
    #[serde(alias = "WORKFLOW", alias = "Workflow")]
    Workflow,
}

impl PackType {
    /// File extension required of the entry file.
    pub fn entry_extension(&self) -> &'static str {
        match self {
            Self::Wasm => ".wasm",
            Self::Workflow => ".json",
        }
    }
}

impl std::fmt::Display for PackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wasm => write!(f, "wasm"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// Filesystem grants, as path globs relative to the pack data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPermissions {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

/// Network grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPermissions {
    /// URL prefixes the pack may connect to.
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default)]
    pub allow_localhost_listen: bool,
}

/// Capabilities requested by a pack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub filesystem: FilesystemPermissions,
    #[serde(default)]
    pub network: NetworkPermissions,
}

/// Resource ceilings for one execution.
///
/// Signed so that negative values in the JSON reach validation and are
/// reported, instead of failing as an opaque parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: i64,
    pub cpu_ms_per_sec: i64,
}

impl ResourceLimits {
    /// Memory ceiling in bytes. Only meaningful after validation.
    pub fn memory_bytes(&self) -> usize {
        (self.memory_mb.max(0) as usize).saturating_mul(1024 * 1024)
    }
}

/// Build provenance recorded by CI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub git_sha: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub target: String,
}

/// Parsed `pack.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    pub schema_version: i64,
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub pack_type: PackType,
    pub entry: String,
    #[serde(default)]
    pub permissions: Permissions,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub build: Option<BuildInfo>,
}

impl PackManifest {
    /// Parses and validates a manifest document.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: PackManifest = serde_json::from_str(text)
            .map_err(|e| Error::manifest("pack.json", format!("malformed JSON: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reads, parses and validates a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > crate::constants::MAX_MANIFEST_SIZE {
            return Err(Error::manifest(
                "pack.json",
                format!("file is {} bytes, limit is {}", meta.len(), crate::constants::MAX_MANIFEST_SIZE),
            ));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Validates every rule in order; the first violation is returned.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version < 1 || self.schema_version > i64::from(MANIFEST_SCHEMA_VERSION) {
            return Err(Error::manifest(
                "schema_version",
                format!(
                    "unsupported value {} (supported: 1..={})",
                    self.schema_version, MANIFEST_SCHEMA_VERSION
                ),
            ));
        }

        if self.id.trim().is_empty() {
            return Err(Error::manifest("id", "must not be blank"));
        }
        validate_pack_id(&self.id)
            .map_err(|reason| Error::manifest("id", format!("'{}' {}", self.id, reason)))?;

        if self.name.trim().is_empty() {
            return Err(Error::manifest("name", "must not be blank"));
        }

        if self.version.trim().is_empty() {
            return Err(Error::manifest("version", "must not be blank"));
        }

        if self.entry.trim().is_empty() {
            return Err(Error::manifest("entry", "must not be blank"));
        }
        let extension = self.pack_type.entry_extension();
        if !self.entry.ends_with(extension) {
            return Err(Error::manifest(
                "entry",
                format!(
                    "'{}' must end with '{}' for {} packs",
                    self.entry, extension, self.pack_type
                ),
            ));
        }
        if let Some(reason) = relative_path_violation(&self.entry) {
            return Err(Error::manifest(
                "entry",
                format!("'{}' {}", self.entry, reason),
            ));
        }

        for (i, path) in self.permissions.filesystem.read.iter().enumerate() {
            if let Some(reason) = relative_path_violation(path) {
                return Err(Error::manifest(
                    format!("permissions.filesystem.read[{}]", i),
                    format!("'{}' {}", path, reason),
                ));
            }
        }

        for (i, path) in self.permissions.filesystem.write.iter().enumerate() {
            if let Some(reason) = relative_path_violation(path) {
                return Err(Error::manifest(
                    format!("permissions.filesystem.write[{}]", i),
                    format!("'{}' {}", path, reason),
                ));
            }
        }

        for (i, url) in self.permissions.network.connect.iter().enumerate() {
            if let Some(reason) = url_violation(url) {
                return Err(Error::manifest(
                    format!("permissions.network.connect[{}]", i),
                    format!("'{}' {}", url, reason),
                ));
            }
        }

        if self.limits.memory_mb <= 0 {
            return Err(Error::manifest(
                "limits.memory_mb",
                format!("must be positive, got {}", self.limits.memory_mb),
            ));
        }
        if self.limits.memory_mb as u64 > MAX_MEMORY_MB {
            return Err(Error::manifest(
                "limits.memory_mb",
                format!("{} exceeds maximum {}", self.limits.memory_mb, MAX_MEMORY_MB),
            ));
        }

        if self.limits.cpu_ms_per_sec <= 0 {
            return Err(Error::manifest(
                "limits.cpu_ms_per_sec",
                format!("must be positive, got {}", self.limits.cpu_ms_per_sec),
            ));
        }
        if self.limits.cpu_ms_per_sec as u64 > CPU_WINDOW_MS {
            return Err(Error::manifest(
                "limits.cpu_ms_per_sec",
                format!(
                    "{} exceeds the {} ms window",
                    self.limits.cpu_ms_per_sec, CPU_WINDOW_MS
                ),
            ));
        }

        for (i, name) in self.required_env.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(Error::manifest(
                    format!("required_env[{}]", i),
                    "must not be blank",
                ));
            }
        }

        Ok(())
    }
}

/// Returns why `path` is not an acceptable pack-relative path, if it isn't.
///
/// Rejects blank, absolute, drive-prefixed and `..`-containing paths. Both
/// separators are considered so a Windows-style path cannot slip through on
/// Unix.
pub fn relative_path_violation(path: &str) -> Option<&'static str> {
    if path.trim().is_empty() {
        return Some("must not be blank");
    }
    if path.contains('\0') {
        return Some("must not contain NUL");
    }

    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return Some("must be relative");
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some("must be relative");
    }

    if unified.split('/').any(|segment| segment == "..") {
        return Some("must not contain '..' segments");
    }

    for component in Path::new(&unified).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => return Some("must be relative"),
            Component::ParentDir => return Some("must not contain '..' segments"),
            _ => {}
        }
    }

    None
}

/// Returns why `url` is not an acceptable connect URL, if it isn't.
pub fn url_violation(url: &str) -> Option<&'static str> {
    let lower = url.trim().to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Some("must use http:// or https://");
    }
    match url::Url::parse(url.trim()) {
        Ok(parsed) if parsed.host_str().is_some_and(|h| !h.is_empty()) => None,
        Ok(_) => Some("must name a host"),
        Err(_) => Some("is not a valid URL"),
    }
}
