//! Executors that drive one run of an instance.
//!
//! An executor is prepared synchronously by [`PackExecutor::start`]: module
//! bytes are read or the workflow document is parsed and validated before
//! any task is spawned, so dispatch failures reach the caller. The run
//! itself happens on a tokio task whose [`RunReport`] is collected by the
//! manager's reaper.

use crate::error::{Error, Result};
use crate::history::ExecutionStatus;
use crate::manifest::PackType;
use crate::pack::Pack;
use crate::sandbox::{self, ExecutionRequest, WasmHost};
use crate::workflow::{RunOptions, WorkflowContext, WorkflowDefinition, WorkflowEngine};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code reported for runs that failed without a guest exit status.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code reported for cancelled runs.
pub const EXIT_CANCELLED: i32 = 130;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub exit_code: i32,
    /// Human-readable reason stored on the instance row.
    pub reason: String,
    pub status: ExecutionStatus,
    /// Captured output for the history item.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn finished(
        started_at: DateTime<Utc>,
        exit_code: i32,
        status: ExecutionStatus,
        reason: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            exit_code,
            reason: reason.into(),
            status,
            output: output.into(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn from_error(started_at: DateTime<Utc>, e: &Error) -> Self {
        match e {
            Error::Cancelled(_) => Self::finished(
                started_at,
                EXIT_CANCELLED,
                ExecutionStatus::Cancelled,
                "cancelled",
                e.to_string(),
            ),
            _ => Self::finished(
                started_at,
                EXIT_FAILURE,
                ExecutionStatus::Failure,
                e.to_string(),
                e.to_string(),
            ),
        }
    }

    /// Report for a run whose task panicked or was aborted.
    pub(crate) fn lost(started_at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::finished(
            started_at,
            EXIT_FAILURE,
            ExecutionStatus::Unknown,
            format!("executor task lost: {}", detail),
            detail,
        )
    }
}

/// Runs a WASM pack's entry module.
///
/// A running guest cannot be suspended. Pausing only flips a flag that is
/// reported back; the guest keeps running until it returns or is stopped.
pub struct WasmExecutor {
    host: Arc<WasmHost>,
    pack: Pack,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
    paused: AtomicBool,
}

impl WasmExecutor {
    pub fn new(host: Arc<WasmHost>, pack: Pack, env: Vec<(String, String)>) -> Self {
        Self {
            host,
            pack,
            env,
            cancel: CancellationToken::new(),
            paused: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) -> Result<JoinHandle<RunReport>> {
        if !self.host.is_available() {
            return Err(Error::RuntimeUnavailable {
                runtime: "wasmtime".to_string(),
                reason: self
                    .host
                    .unavailable_reason()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        let pack_id = self.pack.id.clone();
        let entry = self.pack.entry_path();
        let bytes = tokio::task::spawn_blocking(move || sandbox::read_module(&pack_id, &entry))
            .await
            .map_err(|e| Error::Internal(format!("module read task failed: {}", e)))??;

        let request = ExecutionRequest::new(
            self.pack.manifest.clone(),
            bytes,
            self.pack.install_path.clone(),
        )
        .with_env(self.env.clone())
        .with_cancel(self.cancel.clone());

        let host = Arc::clone(&self.host);
        Ok(tokio::spawn(async move {
            let started_at = Utc::now();
            match host.execute_with_permissions(request).await {
                Ok(out) if out.success() => RunReport::finished(
                    started_at,
                    0,
                    ExecutionStatus::Success,
                    "completed",
                    out.stdout,
                ),
                Ok(out) => RunReport::finished(
                    started_at,
                    out.exit_code,
                    ExecutionStatus::Failure,
                    format!("exited with code {}", out.exit_code),
                    format!("{}{}", out.stdout, out.stderr),
                ),
                Err(e) => RunReport::from_error(started_at, &e),
            }
        }))
    }

    pub fn pause(&self) {
        warn!(pack_id = %self.pack.id, "WASM guest cannot be suspended; marking paused only");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Runs a workflow pack. Pause is honoured at step boundaries.
pub struct WorkflowExecutor {
    engine: Arc<WorkflowEngine>,
    pack: Pack,
    instance_id: u64,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
}

impl WorkflowExecutor {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        pack: Pack,
        instance_id: u64,
        env: Vec<(String, String)>,
    ) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            engine,
            pack,
            instance_id,
            env,
            cancel: CancellationToken::new(),
            pause_tx,
        }
    }

    pub async fn start(&self) -> Result<JoinHandle<RunReport>> {
        let entry = self.pack.entry_path();
        let workflow = tokio::task::spawn_blocking(move || WorkflowDefinition::from_file(&entry))
            .await
            .map_err(|e| Error::Internal(format!("workflow read task failed: {}", e)))??;
        workflow.validate()?;

        let options = RunOptions {
            env: self.env.clone(),
            cancel: self.cancel.clone(),
            pause: Some(self.pause_tx.subscribe()),
        };
        let engine = Arc::clone(&self.engine);
        let pack = self.pack.clone();
        let instance_id = self.instance_id;

        Ok(tokio::spawn(async move {
            let started_at = Utc::now();
            let mut context = WorkflowContext::new(&pack.id, Some(instance_id));
            match engine.execute(&pack, &workflow, &mut context, &options).await {
                Ok(result) => {
                    let output = result
                        .last
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    RunReport::finished(
                        started_at,
                        0,
                        ExecutionStatus::Success,
                        format!("completed {} steps", result.steps_executed),
                        output,
                    )
                }
                Err(e) => RunReport::from_error(started_at, &e),
            }
        }))
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }
}

/// Executor for one run, chosen by pack type.
pub enum PackExecutor {
    Wasm(WasmExecutor),
    Workflow(WorkflowExecutor),
}

impl PackExecutor {
    /// Picks the executor matching `pack`'s type.
    pub fn for_pack(
        engine: &Arc<WorkflowEngine>,
        pack: &Pack,
        instance_id: u64,
        env: Vec<(String, String)>,
    ) -> Self {
        debug!(pack_id = %pack.id, instance_id, "Creating {} executor", pack.pack_type);
        match pack.pack_type {
            PackType::Wasm => Self::Wasm(WasmExecutor::new(
                Arc::clone(engine.host()),
                pack.clone(),
                env,
            )),
            PackType::Workflow => Self::Workflow(WorkflowExecutor::new(
                Arc::clone(engine),
                pack.clone(),
                instance_id,
                env,
            )),
        }
    }

    pub async fn start(&self) -> Result<JoinHandle<RunReport>> {
        match self {
            Self::Wasm(e) => e.start().await,
            Self::Workflow(e) => e.start().await,
        }
    }

    pub fn pause(&self) {
        match self {
            Self::Wasm(e) => e.pause(),
            Self::Workflow(e) => e.pause(),
        }
    }

    pub fn resume(&self) {
        match self {
            Self::Wasm(e) => e.resume(),
            Self::Workflow(e) => e.resume(),
        }
    }

    pub fn stop(&self) {
        match self {
            Self::Wasm(e) => e.stop(),
            Self::Workflow(e) => e.stop(),
        }
    }

    pub fn is_paused(&self) -> bool {
        match self {
            Self::Wasm(e) => e.is_paused(),
            Self::Workflow(e) => e.is_paused(),
        }
    }
}
