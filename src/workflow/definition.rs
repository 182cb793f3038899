//! Workflow definition documents.
//!
//! ```json
//! {
//!   "version": 1,
//!   "name": "sync",
//!   "steps": [
//!     { "id": "fetch", "type": "http", "url": "https://api.example.com/v1/items" },
//!     { "id": "save",  "type": "kv_put", "key": "items", "value": { "count": 3 } },
//!     { "id": "wait",  "type": "sleep", "duration_ms": 500 },
//!     { "id": "done",  "type": "emit_event", "name": "synced" }
//!   ]
//! }
//! ```

use crate::constants::{MAX_SLEEP_MS, MAX_WORKFLOW_SIZE, MAX_WORKFLOW_STEPS};
use crate::error::{Error, Result};
use crate::logbuffer::LogLevel;
use crate::manifest::{relative_path_violation, url_violation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Workflow document version understood by the engine.
pub const WORKFLOW_VERSION: u32 = 1;

fn default_method() -> String {
    "GET".to_string()
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Http {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    WasmCall {
        /// Pack-relative module path. Defaults to the manifest entry.
        #[serde(default)]
        module: Option<String>,
        /// Exported function. Defaults to `_start`.
        #[serde(default)]
        function: Option<String>,
        /// Earlier step whose recorded value becomes the guest's stdin.
        #[serde(default)]
        input_from: Option<String>,
    },
    KvPut {
        key: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    KvGet {
        key: String,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    Sleep {
        duration_ms: u64,
    },
    EmitEvent {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl StepAction {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::WasmCall { .. } => "wasm_call",
            Self::KvPut { .. } => "kv_put",
            Self::KvGet { .. } => "kv_get",
            Self::Log { .. } => "log",
            Self::Sleep { .. } => "sleep",
            Self::EmitEvent { .. } => "emit_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(flatten)]
    pub action: StepAction,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }
}

/// A parsed workflow entry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub version: u32,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            version: WORKFLOW_VERSION,
            name: name.into(),
            steps,
        }
    }

    /// Parses and validates a workflow document.
    pub fn from_json(text: &str) -> Result<Self> {
        let workflow: Self = serde_json::from_str(text)
            .map_err(|e| Error::InvalidWorkflow(format!("malformed JSON: {}", e)))?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let len = std::fs::metadata(path)?.len();
        if len > MAX_WORKFLOW_SIZE {
            return Err(Error::InvalidWorkflow(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                len,
                MAX_WORKFLOW_SIZE
            )));
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Checks structure before any step runs. The first problem wins.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidWorkflow(msg));

        if self.version != WORKFLOW_VERSION {
            return invalid(format!(
                "unsupported version {} (expected {})",
                self.version, WORKFLOW_VERSION
            ));
        }
        if self.steps.is_empty() {
            return invalid("workflow has no steps".to_string());
        }
        if self.steps.len() > MAX_WORKFLOW_STEPS {
            return invalid(format!(
                "{} steps exceeds maximum {}",
                self.steps.len(),
                MAX_WORKFLOW_STEPS
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return invalid(format!("steps[{}]: id must not be blank", i));
            }
            let at = |msg: &str| format!("step '{}': {}", step.id, msg);

            match &step.action {
                StepAction::Http { method, url, .. } => {
                    if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
                        return invalid(at(&format!("invalid HTTP method '{}'", method)));
                    }
                    if let Some(reason) = url_violation(url) {
                        return invalid(at(&format!("url '{}' {}", url, reason)));
                    }
                }
                StepAction::WasmCall {
                    module,
                    function,
                    input_from,
                } => {
                    if let Some(module) = module
                        && let Some(reason) = relative_path_violation(module)
                    {
                        return invalid(at(&format!("module '{}' {}", module, reason)));
                    }
                    if function.as_ref().is_some_and(|f| f.trim().is_empty()) {
                        return invalid(at("function must not be blank"));
                    }
                    if let Some(source) = input_from
                        && !seen.contains(source.as_str())
                    {
                        return invalid(at(&format!(
                            "input_from '{}' does not name an earlier step",
                            source
                        )));
                    }
                }
                StepAction::KvPut { key, .. } | StepAction::KvGet { key } => {
                    if key.trim().is_empty() {
                        return invalid(at("key must not be blank"));
                    }
                }
                StepAction::Log { message, .. } => {
                    if message.trim().is_empty() {
                        return invalid(at("message must not be blank"));
                    }
                }
                StepAction::Sleep { duration_ms } => {
                    if *duration_ms > MAX_SLEEP_MS {
                        return invalid(at(&format!(
                            "duration {} ms exceeds maximum {} ms",
                            duration_ms, MAX_SLEEP_MS
                        )));
                    }
                }
                StepAction::EmitEvent { name, .. } => {
                    if name.trim().is_empty() {
                        return invalid(at("event name must not be blank"));
                    }
                }
            }

            if !seen.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
        }

        Ok(())
    }
}
