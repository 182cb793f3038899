//! # Pack Filename Codec
//!
//! Release artifacts are named `pack-<variant>-<target>-<version>.zip`.
//!
//! ## Split Rule
//!
//! Variant and target share a character class, so a name with several
//! hyphens is ambiguous. The codec resolves it deterministically:
//!
//! - **variant** is the first hyphen-delimited segment,
//! - **version** is the last segment,
//! - **target** is everything in between, joined with `-`.
//!
//! ```text
//! pack-guard-android-arm64-v1.2.3.zip
//!      ^^^^^ ^^^^^^^^^^^^^ ^^^^^^
//!     variant    target    version
//! ```
//!
//! It follows that variants and versions never contain hyphens, while
//! targets may. [`PackName::construct`] refuses inputs the rule could not
//! reproduce, so every name it builds parses back to the same parts.
//!
//! Character classes: variant and target segments are `[a-z0-9]+`. The
//! version is the rest of the name up to `.zip`: any printable characters
//! except `-`, path separators and whitespace, not starting or ending with
//! `.` (`v1.2.3`, `1.0.0_rc1`, `V1.2`, `2.0+build.7`).

use crate::constants::{PACK_FILENAME_PREFIX, PACK_FILENAME_SUFFIX};
use crate::error::{Error, Result};
use std::fmt;

/// Components of a pack archive filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackName {
    pub variant: String,
    pub target: String,
    pub version: String,
}

impl PackName {
    /// Parses a filename, returning `None` if it does not conform.
    pub fn parse(filename: &str) -> Option<Self> {
        let body = filename
            .strip_prefix(PACK_FILENAME_PREFIX)?
            .strip_suffix(PACK_FILENAME_SUFFIX)?;

        let segments: Vec<&str> = body.split('-').collect();
        if segments.len() < 3 {
            return None;
        }

        let variant = segments[0];
        let version = segments[segments.len() - 1];
        let target_segments = &segments[1..segments.len() - 1];

        if !is_segment(variant) || !is_version(version) {
            return None;
        }
        if !target_segments.iter().all(|s| is_segment(s)) {
            return None;
        }

        Some(Self {
            variant: variant.to_string(),
            target: target_segments.join("-"),
            version: version.to_string(),
        })
    }

    /// Parses the last path segment of a URL or path.
    ///
    /// Query strings and fragments are ignored.
    pub fn parse_from_url(url: &str) -> Option<Self> {
        Self::parse(filename_from_url(url))
    }

    /// Builds the canonical filename for the given parts.
    pub fn construct(variant: &str, target: &str, version: &str) -> Result<String> {
        let invalid = |reason: String| Error::InvalidPackFilename {
            filename: format!(
                "{}{}-{}-{}{}",
                PACK_FILENAME_PREFIX, variant, target, version, PACK_FILENAME_SUFFIX
            ),
            reason,
        };

        if !is_segment(variant) {
            return Err(invalid(format!(
                "variant '{}' must match [a-z0-9]+ (no hyphens)",
                variant
            )));
        }
        if target.is_empty() || !target.split('-').all(is_segment) {
            return Err(invalid(format!(
                "target '{}' must be hyphen-separated [a-z0-9]+ segments",
                target
            )));
        }
        if !is_version(version) {
            return Err(invalid(format!(
                "version '{}' must be non-empty, without hyphens, separators, whitespace or edge dots",
                version
            )));
        }

        Ok(format!(
            "{}{}-{}-{}{}",
            PACK_FILENAME_PREFIX, variant, target, version, PACK_FILENAME_SUFFIX
        ))
    }

    /// Returns the canonical filename for these parts.
    pub fn filename(&self) -> String {
        format!(
            "{}{}-{}-{}{}",
            PACK_FILENAME_PREFIX, self.variant, self.target, self.version, PACK_FILENAME_SUFFIX
        )
    }
}

impl fmt::Display for PackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}

/// Returns the last path segment of a URL, without query or fragment.
pub fn filename_from_url(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(without_query)
}

fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_version(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s
            .chars()
            .all(|c| !matches!(c, '-' | '/' | '\\') && !c.is_whitespace() && !c.is_control())
}
