//! Error types for pack installation and execution.
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped by [`ErrorCategory`] so callers can decide whether to retry,
//! surface a security alert, or disable a feature up front.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for pack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input: manifest, filename, workflow, lifecycle misuse.
    Validation,
    /// Integrity or capability violation. Never retried.
    Security,
    /// Network or remote failure that may succeed on retry.
    Transient,
    /// Memory, CPU or size ceiling hit during execution or extraction.
    ResourceLimit,
    /// Execution engine not present on this platform.
    Unavailable,
    /// Local I/O, serialization or invariant failure.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Security => write!(f, "security"),
            Self::Transient => write!(f, "transient"),
            Self::ResourceLimit => write!(f, "resource-limit"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur while installing or running packs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Manifest failed structural or security validation.
    #[error("invalid manifest field '{field}': {reason}")]
    InvalidManifest { field: String, reason: String },

    /// Archive filename does not follow `pack-<variant>-<target>-<version>.zip`.
    #[error("invalid pack filename '{filename}': {reason}")]
    InvalidPackFilename { filename: String, reason: String },

    /// Workflow definition failed validation.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// `pack.json` missing from the archive root.
    #[error("pack.json not found at archive root")]
    ManifestMissing,

    /// Manifest entry file missing from the extracted tree.
    #[error("entry file '{entry}' not found in pack")]
    EntryMissing { entry: String },

    /// Prod install attempted without an expected checksum.
    #[error("prod install of '{url}' requires an expected SHA-256 checksum")]
    ChecksumRequired { url: String },

    /// Required environment variables absent from the start request.
    #[error("missing required secrets: {}", .0.join(", "))]
    MissingSecrets(Vec<String>),

    /// An executor is already tracked for the instance.
    #[error("instance {0} is already running")]
    AlreadyRunning(u64),

    /// Instance is in the wrong state for the operation.
    #[error("instance {id} is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: u64,
        state: String,
        expected: String,
    },

    /// Pack not present in the store.
    #[error("pack not found: {0}")]
    PackNotFound(String),

    /// Instance row not present.
    #[error("instance not found: {0}")]
    InstanceNotFound(u64),

    /// A workflow step failed and aborted the run.
    #[error("workflow step '{step_id}' failed: {cause}")]
    StepFailed { step_id: String, cause: String },

    // =========================================================================
    // Security Errors
    // =========================================================================
    /// Downloaded artifact digest does not match the expected checksum.
    #[error("checksum mismatch for {artifact}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    /// Archive entry escapes the extraction directory.
    #[error("path traversal detected in archive entry: {path}")]
    PathTraversal { path: String },

    /// Requested capability violates the execution policy.
    #[error("permission denied for pack '{pack_id}': {reason}")]
    PermissionDenied { pack_id: String, reason: String },

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Remote answered with a non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Connection-level failure (DNS, reset, TLS).
    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Resource Limit Errors
    // =========================================================================
    /// Sandbox exceeded its memory or CPU allowance.
    #[error("pack '{pack_id}' exceeded its {resource} limit: {detail}")]
    ResourceLimitExceeded {
        pack_id: String,
        resource: String,
        detail: String,
    },

    /// Archive exceeds entry-count or extracted-size bounds.
    #[error("archive exceeds limit: {0}")]
    ArchiveTooLarge(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Engine could not be created on this platform.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Module failed to compile or instantiate.
    #[error("invalid module for pack '{pack_id}': {reason}")]
    InvalidModule { pack_id: String, reason: String },

    /// Guest trapped during the entry call.
    #[error("pack '{pack_id}' trapped in '{function}': {reason}")]
    WasmTrap {
        pack_id: String,
        function: String,
        reason: String,
    },

    /// Run was cancelled by a stop request.
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Archive / Storage Errors
    // =========================================================================
    /// Zip archive unreadable.
    #[error("failed to read archive {path}: {reason}")]
    ArchiveFailed { path: PathBuf, reason: String },

    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Relocation into the pack store failed.
    #[error("failed to write pack store: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidManifest { .. }
            | Self::InvalidPackFilename { .. }
            | Self::InvalidWorkflow(_)
            | Self::ManifestMissing
            | Self::EntryMissing { .. }
            | Self::ChecksumRequired { .. }
            | Self::MissingSecrets(_)
            | Self::AlreadyRunning(_)
            | Self::InvalidState { .. }
            | Self::PackNotFound(_)
            | Self::InstanceNotFound(_)
            | Self::StepFailed { .. }
            | Self::InvalidModule { .. }
            | Self::WasmTrap { .. }
            | Self::Cancelled(_) => ErrorCategory::Validation,

            Self::ChecksumMismatch { .. }
            | Self::PathTraversal { .. }
            | Self::PermissionDenied { .. } => ErrorCategory::Security,

            Self::Http { .. } | Self::Network { .. } | Self::Timeout { .. } => {
                ErrorCategory::Transient
            }

            Self::ResourceLimitExceeded { .. } | Self::ArchiveTooLarge(_) => {
                ErrorCategory::ResourceLimit
            }

            Self::RuntimeUnavailable { .. } => ErrorCategory::Unavailable,

            Self::ArchiveFailed { .. }
            | Self::StorageInitFailed { .. }
            | Self::StorageWriteFailed(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true if a caller may retry the failed operation.
    ///
    /// Only connection failures, timeouts, HTTP 5xx and HTTP 429 qualify.
    /// Any other 4xx is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// Returns true for integrity and capability violations.
    pub fn is_security(&self) -> bool {
        self.category() == ErrorCategory::Security
    }

    pub(crate) fn manifest(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
