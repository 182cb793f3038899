//! # packrun
//!
//! **Verified Pack Installation and Sandboxed Execution**
//!
//! This crate installs versioned "packs" (zip archives holding a `pack.json`
//! manifest and an entry file) and runs them. A WASM pack runs inside a
//! wasmtime sandbox with memory, CPU and filesystem bounds taken from its
//! manifest. A WORKFLOW pack is a JSON list of steps interpreted by the
//! workflow engine.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             packrun                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     PackInstaller                           │    │
//! │  │  name → download → checksum → extract → manifest → relocate │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                       PackStore                           │      │
//! │  │  Per-id locks │ Atomic relocation │ JSON install records  │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                    InstanceManager                        │      │
//! │  │  Stopped ⇄ Running ⇄ Paused │ Reaper │ Execution history  │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐        ┌─────────────────────────┐      │
//! │  │       WasmHost         │ ◄───── │     WorkflowEngine      │      │
//! │  │  WASI p1 + preopens    │        │  http │ wasm_call │ kv  │      │
//! │  │  Fuel + epoch CPU cap  │        │  log │ sleep │ events   │      │
//! │  └────────────────────────┘        └─────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! | Stage            | Guard                                              |
//! |------------------|----------------------------------------------------|
//! | Download         | Size cap, bearer auth, timeouts                    |
//! | Checksum         | SHA-256 required for prod installs                 |
//! | Extraction       | No `..`, absolute paths or symlinks; size limits   |
//! | Manifest         | Schema version, limits, relative grant paths       |
//! | Execution        | Deny by default; grants under `<pack>/data` only   |
//!
//! ## Key Security Properties
//!
//! - **Atomic Installs**: packs are staged, then renamed into place under a
//!   per-id lock. A failed install leaves the previous version untouched.
//! - **Path Confinement**: every filesystem grant is canonicalized and must
//!   stay under the pack's data directory (see
//!   [`permissions::plan_preopens`]).
//! - **Bounded Guests**: memory growth is refused above `memory_mb`, CPU is
//!   charged per epoch tick against `cpu_ms_per_sec`, and fuel caps total
//!   work.
//!
//! # Example
//!
//! ```rust,ignore
//! use packrun::{HttpFetcher, InstallSource, PackInstaller, PackStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> packrun::Result<()> {
//!     let store = Arc::new(PackStore::new()?);
//!     let installer = PackInstaller::new(store, Arc::new(HttpFetcher::new()?));
//!     let result = installer
//!         .install(InstallSource::prod(
//!             "v1.2.3",
//!             "https://example.com/pack-demo-linux-v1.2.3.zip",
//!             "0123...cdef",
//!         ))
//!         .await?;
//!     println!("installed {}", result.pack.id);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod error;
pub mod history;
pub mod installer;
pub mod instance;
pub mod kv;
pub mod logbuffer;
pub mod manifest;
pub mod pack;
pub mod pack_name;
pub mod permissions;
pub mod remote;
pub mod retry;
pub mod sandbox;
pub mod secrets;
pub mod store;
pub mod workflow;

// Re-exports
pub use config::RuntimeConfig;
pub use constants::*;
pub use error::{Error, ErrorCategory, Result};
pub use history::{ExecutionHistoryItem, ExecutionStatus, HistoryStore};
pub use installer::{InstallResult, InstallStage, PackInstaller};
pub use instance::{
    Instance, InstanceManager, InstanceRepository, InstanceState, JsonInstanceRepository,
    MemoryInstanceRepository, PackExecutor,
};
pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};
pub use logbuffer::{LogBuffer, LogEntry, LogLevel};
pub use manifest::{PackManifest, PackType, Permissions, ResourceLimits};
pub use pack::{InstallSource, Pack};
pub use pack_name::PackName;
pub use remote::{ArtifactFetcher, HttpFetcher, PollPolicy, RemoteRunClient, RunArtifact, RunStatus};
pub use retry::{Backoff, RetryPolicy};
pub use sandbox::{ExecutionOutput, ExecutionRequest, WasmHost};
pub use secrets::{EnvSecretResolver, SecretResolver, StaticSecretResolver};
pub use store::PackStore;
pub use workflow::{WorkflowDefinition, WorkflowEngine};
