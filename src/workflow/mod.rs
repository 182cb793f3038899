//! # Workflow Engine
//!
//! Interprets WORKFLOW packs: a JSON document listing steps that run one
//! after another on behalf of a pack.
//!
//! ## Run Lifecycle
//!
//! ```text
//! Validating ─► [ Pending ─► Executing ─► Succeeded | Failed ]* ─► Completed | Aborted
//! ```
//!
//! ## Step Types
//!
//! | type         | result                                  |
//! |--------------|-----------------------------------------|
//! | `http`       | `{ "status": u16, "body": json-or-text }` |
//! | `wasm_call`  | `{ "exit_code", "stdout", "results" }`  |
//! | `kv_put`     | `true`                                  |
//! | `kv_get`     | stored value, or `null` if absent       |
//! | `log`        | `null`                                  |
//! | `sleep`      | `null`                                  |
//! | `emit_event` | `null`                                  |
//!
//! HTTP steps are checked against the pack's network allow-list; a non-2xx
//! response fails the step. WASM steps delegate to the
//! [`WasmHost`](crate::sandbox::WasmHost) with the pack's permissions.
//!
//! ## Module Structure
//!
//! - [`definition`]: workflow documents and their validation
//! - [`context`]: ordered per-run step outcomes
//! - [`engine`]: the interpreter

pub mod context;
pub mod definition;
pub mod engine;

pub use context::{StepOutcome, WorkflowContext};
pub use definition::{StepAction, WORKFLOW_VERSION, WorkflowDefinition, WorkflowStep};
pub use engine::{RunOptions, WorkflowEngine, WorkflowEvent, WorkflowResult};
