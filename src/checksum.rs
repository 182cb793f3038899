//! # Checksum Verification
//!
//! Streaming SHA-256 digests for downloaded artifacts and parsing of the
//! `checksums.sha256` files published with release builds.
//!
//! Digests are computed in [`DIGEST_CHUNK_SIZE`] chunks so archives of any
//! size are hashed with bounded memory.
//!
//! ## Checksum File Format
//!
//! ```text
//! # release v1.2.3
//! 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08  pack-guard-android-arm64-v1.2.3.zip
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Malformed lines are
//! skipped rather than failing the whole file.

use crate::constants::DIGEST_CHUNK_SIZE;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Computes the lowercase hex SHA-256 of everything readable from `reader`.
pub fn digest_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the lowercase hex SHA-256 of a file.
pub fn digest_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    digest_reader(file)
}

/// Computes the lowercase hex SHA-256 of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Returns true if `actual` and `expected` name the same digest.
///
/// Comparison is case-insensitive and ignores surrounding whitespace.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

/// Verifies a file against an expected hex digest.
pub fn verify(path: &Path, expected_hex: &str) -> Result<bool> {
    let actual = digest_file(path)?;
    Ok(digests_match(&actual, expected_hex))
}

/// Returns true if `s` is a 64-character hex string.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parses a `checksums.sha256` document into `filename → lowercase hex`.
pub fn parse_checksum_manifest(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((hash, rest)) = line.split_once(char::is_whitespace) else {
            debug!(line = lineno + 1, "skipping checksum line without filename");
            continue;
        };

        // `sha256sum -b` prefixes binary-mode names with '*'
        let filename = rest.trim_start();
        let filename = filename.strip_prefix('*').unwrap_or(filename);

        if !is_sha256_hex(hash) || filename.is_empty() {
            debug!(line = lineno + 1, "skipping malformed checksum line");
            continue;
        }

        entries.insert(filename.to_string(), hash.to_ascii_lowercase());
    }

    entries
}
