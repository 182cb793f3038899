//! # Instances
//!
//! An instance binds an installed pack to a name and a lifecycle. Starting
//! an instance attaches an executor chosen by pack type:
//!
//! | pack type  | executor             | pause                         |
//! |------------|----------------------|-------------------------------|
//! | `wasm`     | [`WasmExecutor`]     | flag only, guest keeps running |
//! | `workflow` | [`WorkflowExecutor`] | waits at the next step boundary |
//!
//! Completion is observed by a reaper task that stops the row, appends an
//! [`ExecutionHistoryItem`](crate::history::ExecutionHistoryItem) and
//! detaches the executor.

pub mod executor;
pub mod manager;
pub mod repository;
pub mod state;

pub use executor::{EXIT_CANCELLED, EXIT_FAILURE, PackExecutor, RunReport, WasmExecutor, WorkflowExecutor};
pub use manager::InstanceManager;
pub use repository::{InstanceRepository, JsonInstanceRepository, MemoryInstanceRepository};
pub use state::{Instance, InstanceState};
