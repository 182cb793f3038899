//! Instance rows and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance.
///
/// ```text
///   Stopped ──▶ Running ◀──▶ Paused
///      ▲           │            │
///      └───────────┴────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl InstanceState {
    /// Returns true while an executor may be attached.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// A named, startable binding of a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Monotonic id assigned by the repository.
    pub id: u64,
    pub pack_id: String,
    pub name: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_exit_reason: Option<String>,
}

impl Instance {
    pub fn new(id: u64, pack_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            pack_id: pack_id.into(),
            name: name.into(),
            state: InstanceState::Stopped,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_exit_code: None,
            last_exit_reason: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = InstanceState::Running;
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
    }

    pub(crate) fn mark_stopped(&mut self, exit_code: Option<i32>, reason: impl Into<String>) {
        self.state = InstanceState::Stopped;
        self.stopped_at = Some(Utc::now());
        self.last_exit_code = exit_code;
        self.last_exit_reason = Some(reason.into());
    }
}
