//! # Pack Runtime Constants
//!
//! Defines resource limits, timeouts, file names and validation patterns
//! for pack installation and execution. These constants are the **single
//! source of truth** for security-critical bounds throughout the crate.
//!
//! ## Cross-References
//!
//! - [`crate::archive`]: entry count and extracted size bounds
//! - [`crate::installer`]: archive size bound and download timeout
//! - [`crate::sandbox`]: fuel, epoch tick and output capture bounds
//! - [`crate::workflow`]: sleep and HTTP bounds
//! - [`crate::manifest`]: identifier validation

use std::time::Duration;

// =============================================================================
// Pack Layout
// =============================================================================

/// Manifest file name at the root of every pack archive.
pub const MANIFEST_FILE: &str = "pack.json";

/// Checksum manifest published alongside release artifacts.
pub const CHECKSUM_FILE: &str = "checksums.sha256";

/// Prefix of every pack archive filename.
pub const PACK_FILENAME_PREFIX: &str = "pack-";

/// Suffix of every pack archive filename.
pub const PACK_FILENAME_SUFFIX: &str = ".zip";

/// Per-pack data directory, the root for manifest filesystem grants.
pub const PACK_DATA_DIR: &str = "data";

/// Subdirectory of the store holding persisted pack records.
pub const PACK_RECORDS_DIR: &str = "records";

/// Subdirectory of the store used for install staging.
///
/// Staging lives next to the pack directories so the final relocation is a
/// same-volume rename.
pub const PACK_STAGING_DIR: &str = ".staging";

/// Highest manifest schema version understood by this crate.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum downloaded archive size (256 MiB).
///
/// **Security**: a malicious host could stream an unbounded body; the
/// download aborts once this many bytes have been written.
pub const MAX_ARCHIVE_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum total uncompressed size of an extracted pack (1 GiB).
///
/// **Attack Vector**: zip bombs (small compressed, huge uncompressed).
pub const MAX_EXTRACTED_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum number of entries in a pack archive.
///
/// **Attack Vector**: inode exhaustion from millions of tiny files.
pub const MAX_ARCHIVE_ENTRIES: usize = 10_000;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Maximum workflow definition size (4 MiB).
pub const MAX_WORKFLOW_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum WASM module size (64 MiB).
///
/// **Security**: compilation uses a multiple of the module size in memory.
pub const MAX_WASM_MODULE_SIZE: usize = 64 * 1024 * 1024;

/// Maximum bytes of guest stdout/stderr captured per execution (1 MiB).
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

/// Chunk size for streaming digests.
pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum pack identifier length.
///
/// Pack ids name store directories, so they are bounded like container ids.
pub const MAX_PACK_ID_LEN: usize = 128;

// =============================================================================
// Execution Limits
// =============================================================================

/// Maximum memory a manifest may request (4 GiB, the wasm32 address space).
pub const MAX_MEMORY_MB: u64 = 4096;

/// Milliseconds in one CPU budget window.
///
/// `cpu_ms_per_sec` can never exceed the window length.
pub const CPU_WINDOW_MS: u64 = 1000;

/// Interval between epoch increments used for CPU accounting.
///
/// **Rationale**: 10 ms keeps accounting granularity well below typical
/// budgets (100 ms/s) while costing one atomic add per tick.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Total fuel ceiling for one execution (10 billion operations).
///
/// **Recovery**: exhaustion traps with `OutOfFuel` and is reported as a CPU
/// limit violation.
pub const DEFAULT_WASM_FUEL: u64 = 10_000_000_000;

/// Default entry function for WASM packs.
pub const DEFAULT_ENTRY_FUNCTION: &str = "_start";

/// Maximum number of concurrently tracked instance executors.
pub const MAX_RUNNING_INSTANCES: usize = 256;

/// How long a stop waits for the cancelled run to record its outcome
/// before detaching it forcibly.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Workflow Limits
// =============================================================================

/// Maximum steps in a single workflow.
pub const MAX_WORKFLOW_STEPS: usize = 1024;

/// Longest single sleep step (1 hour).
pub const MAX_SLEEP_MS: u64 = 60 * 60 * 1000;

/// Default HTTP step timeout.
pub const DEFAULT_HTTP_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum HTTP response body retained in a step result (4 MiB).
pub const MAX_HTTP_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Maximum redirects an HTTP step follows.
///
/// **Security**: every hop is re-checked against the pack's network
/// allow-list, so a declared host cannot forward a step elsewhere.
pub const MAX_HTTP_REDIRECTS: usize = 5;

// =============================================================================
// Timeouts and Retry
// =============================================================================

/// Timeout for a single artifact download (10 minutes).
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Connect timeout for remote requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// First retry delay.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Retry delay cap.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry delay multiplier.
pub const RETRY_MULTIPLIER: u32 = 2;

/// Default attempt bound for retried operations.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Interval between remote run status polls.
pub const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum polls before a remote run wait fails with a timeout.
pub const REMOTE_POLL_MAX_ATTEMPTS: u32 = 120;

// =============================================================================
// Logging and History
// =============================================================================

/// Default capacity of the in-memory log ring buffer.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 500;

/// Maximum characters of captured output stored per history item.
pub const MAX_HISTORY_OUTPUT: usize = 64 * 1024;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for pack identifiers.
///
/// **Security**: excludes `/` and `\` so ids cannot form paths.
pub const PACK_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Validates a pack identifier for use as a store directory name.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` describing the failure.
#[inline]
#[must_use = "validation result must be checked to ensure the pack id is safe"]
pub fn validate_pack_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.trim().is_empty() {
        return Err("must not be blank");
    }
    if id.len() > MAX_PACK_ID_LEN {
        return Err("exceeds maximum length");
    }
    if id == "." || id == ".." {
        return Err("must not be a relative directory name");
    }
    if id.starts_with('.') {
        return Err("must not start with '.'");
    }
    if !id.chars().all(|c| PACK_ID_VALID_CHARS.contains(c)) {
        return Err("contains invalid characters");
    }
    Ok(())
}
