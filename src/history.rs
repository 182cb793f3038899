//! Append-only execution history.
//!
//! Items are never mutated once written. The store keeps them in memory
//! and, when file-backed, appends each one as a JSON line. Pruning rewrites
//! the file atomically.

use crate::constants::MAX_HISTORY_OUTPUT;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHistoryItem {
    pub pack_id: String,
    pub pack_name: String,
    pub run_id: Uuid,
    pub status: ExecutionStatus,
    /// Captured output, truncated to [`MAX_HISTORY_OUTPUT`] bytes.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub artifact: Option<String>,
}

impl ExecutionHistoryItem {
    /// Creates an item with a fresh run id.
    pub fn new(
        pack_id: impl Into<String>,
        pack_name: impl Into<String>,
        status: ExecutionStatus,
        output: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pack_id: pack_id.into(),
            pack_name: pack_name.into(),
            run_id: Uuid::now_v7(),
            status,
            output: truncate_output(output.into()),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0),
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_HISTORY_OUTPUT {
        let mut end = MAX_HISTORY_OUTPUT;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
    }
    output
}

/// History store, optionally backed by a JSON Lines file.
pub struct HistoryStore {
    path: Option<PathBuf>,
    items: RwLock<Vec<ExecutionHistoryItem>>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: RwLock::new(Vec::new()),
        }
    }

    /// Opens (or creates) a file-backed store. Malformed lines are skipped.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageInitFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let mut items = Vec::new();
        match fs::read_to_string(path) {
            Ok(content) => {
                for (n, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ExecutionHistoryItem>(line) {
                        Ok(item) => items.push(item),
                        Err(e) => warn!("Skipping malformed history line {}: {}", n + 1, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Loaded {} history items from {}", items.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            items: RwLock::new(items),
        })
    }

    pub fn append(&self, item: ExecutionHistoryItem) -> Result<()> {
        let mut items = self
            .items
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;

        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&item)?;
            line.push('\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
        }

        items.push(item);
        Ok(())
    }

    /// Items newest first, optionally for one pack.
    pub fn list(&self, pack_id: Option<&str>) -> Result<Vec<ExecutionHistoryItem>> {
        let items = self
            .items
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        let mut out: Vec<_> = items
            .iter()
            .filter(|i| pack_id.is_none_or(|p| i.pack_id == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }

    /// Removes items that finished before `cutoff`. Returns how many.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.retain(|item| item.finished_at >= cutoff)
    }

    /// Removes every item, or every item of one pack. Returns how many.
    pub fn clear(&self, pack_id: Option<&str>) -> Result<usize> {
        self.retain(|item| pack_id.is_some_and(|p| item.pack_id != p))
    }

    fn retain(&self, keep: impl Fn(&ExecutionHistoryItem) -> bool) -> Result<usize> {
        let mut items = self
            .items
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        let before = items.len();
        let kept: Vec<ExecutionHistoryItem> = items.iter().filter(|i| keep(i)).cloned().collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Some(path) = &self.path {
            let mut content = String::new();
            for item in &kept {
                content.push_str(&serde_json::to_string(item)?);
                content.push('\n');
            }
            let temp = path.with_extension(format!("tmp.{}", Uuid::now_v7()));
            fs::write(&temp, content)?;
            fs::rename(&temp, path).map_err(|e| {
                let _ = fs::remove_file(&temp);
                Error::StorageWriteFailed(e.to_string())
            })?;
        }

        *items = kept;
        Ok(removed)
    }
}
