//! # Sandboxed Execution Host
//!
//! Runs pack WebAssembly modules under wasmtime with the capability set and
//! resource limits declared in the pack manifest.
//!
//! ## Security Model
//!
//! | Capability       | Granted                                          |
//! |------------------|--------------------------------------------------|
//! | Filesystem       | Only preopens derived from manifest grants       |
//! | Network          | None (WASI preview 1 links no sockets)           |
//! | Environment vars | Only those in the request (resolved secrets)     |
//! | Stdin            | The request input                                |
//! | Stdout/Stderr    | Captured into bounded memory pipes               |
//! | Memory           | `limits.memory_mb`, growth beyond it traps       |
//! | CPU              | `limits.cpu_ms_per_sec` per one-second window    |
//!
//! Enforcement lives in the embedding, not in guest cooperation: a module
//! has no import through which it could reach an undeclared path or host.
//!
//! ### CPU Budget
//!
//! A ticker thread increments the engine epoch every [`EPOCH_TICK`]. Each
//! store sets its deadline one tick ahead, so the epoch callback fires
//! roughly once per tick of guest execution. The callback charges the tick
//! to the current one-second window and traps once the window's charge
//! exceeds `cpu_ms_per_sec`. Time spent blocked in host calls is not
//! charged. Fuel ([`DEFAULT_WASM_FUEL`]) bounds total work independently.
//!
//! ### Cancellation
//!
//! Guests run on wasmtime's async fibers. The call is raced against the
//! request's cancellation token, and the store is dropped on the cancel
//! branch, so a guest parked in a host call (a `poll_oneoff` sleep, say)
//! is torn down as soon as the token fires. The epoch callback checks the
//! token too and yields every tick, which covers guests spinning in pure
//! computation. A token that fires while the call is returning still
//! reports [`Error::Cancelled`].
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ─► ModuleLoaded ─► Instantiated ─► Running ─┬─► Completed ─┐
//!                                                  ├─► Trapped   ─┼─► TornDown
//!                                                  └─► TimedOut  ─┘
//! ```
//!
//! The store (and with it the instance and WASI context) is dropped before
//! the module on every path, including traps and cancellation.

use crate::constants::{
    CPU_WINDOW_MS, DEFAULT_ENTRY_FUNCTION, DEFAULT_WASM_FUEL, EPOCH_TICK, MAX_CAPTURED_OUTPUT,
    MAX_WASM_MODULE_SIZE,
};
use crate::error::{Error, Result};
use crate::manifest::PackManifest;
use crate::permissions::{self, Preopen};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasmtime::{
    Config, Engine, Linker, Module, ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder, Trap,
    UpdateDeadline, Val,
};
use wasmtime_wasi::preview1::{self as p1, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

/// Name reported in [`Error::RuntimeUnavailable`].
const RUNTIME_NAME: &str = "wasmtime";

/// One execution of a pack module.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub pack_id: String,
    pub manifest: PackManifest,
    pub module_bytes: Vec<u8>,
    /// Exported function to call with no arguments.
    pub entry_function: String,
    pub env: Vec<(String, String)>,
    /// Bytes presented on the guest's stdin.
    pub input: Vec<u8>,
    /// Installed pack directory; grants resolve under `<pack_root>/data`.
    pub pack_root: PathBuf,
    pub cancel: CancellationToken,
    /// Overrides [`DEFAULT_WASM_FUEL`].
    pub fuel: Option<u64>,
}

impl ExecutionRequest {
    /// Creates a request for the default entry function with empty input.
    pub fn new(manifest: PackManifest, module_bytes: Vec<u8>, pack_root: impl Into<PathBuf>) -> Self {
        Self {
            pack_id: manifest.id.clone(),
            manifest,
            module_bytes,
            entry_function: DEFAULT_ENTRY_FUNCTION.to_string(),
            env: Vec::new(),
            input: Vec::new(),
            pack_root: pack_root.into(),
            cancel: CancellationToken::new(),
            fuel: None,
        }
    }

    pub fn with_entry_function(mut self, function: impl Into<String>) -> Self {
        self.entry_function = function.into();
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// WASI exit status; 0 when the entry function returned normally.
    pub exit_code: i32,
    /// Values returned by the entry function.
    pub results: Vec<serde_json::Value>,
    pub stdout: String,
    pub stderr: String,
    pub fuel_consumed: u64,
    pub duration: Duration,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reasons the host interrupts a guest. Carried through wasmtime as the
/// error of a trap so the call site can classify it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum Interrupt {
    #[error("CPU budget of {budget_ms} ms per second exceeded")]
    CpuBudget { budget_ms: u64 },
    #[error("memory growth to {desired} bytes exceeds limit of {limit} bytes")]
    Memory { desired: usize, limit: usize },
    #[error("cancelled")]
    Cancelled,
}

/// Per-store host state.
struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    memory_limit: usize,
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if !self.limits.memory_growing(current, desired, maximum)? {
            return Err(anyhow::Error::new(Interrupt::Memory {
                desired,
                limit: self.memory_limit,
            }));
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }
}

/// Charges epoch ticks against a one-second window.
struct CpuMeter {
    budget_ms: u64,
    tick_ms: u64,
    window_start: Instant,
    charged_ms: u64,
}

impl CpuMeter {
    fn new(budget_ms: u64) -> Self {
        Self {
            budget_ms,
            tick_ms: EPOCH_TICK.as_millis().max(1) as u64,
            window_start: Instant::now(),
            charged_ms: 0,
        }
    }

    /// Charges one tick. Returns false once the window is over budget.
    fn charge(&mut self) -> bool {
        if self.window_start.elapsed() >= Duration::from_millis(CPU_WINDOW_MS) {
            self.window_start = Instant::now();
            self.charged_ms = 0;
        }
        self.charged_ms += self.tick_ms;
        self.charged_ms <= self.budget_ms
    }
}

/// WebAssembly execution host.
///
/// ## Thread Safety
///
/// `WasmHost` is `Send + Sync`. Each execution gets its own store; the
/// engine is shared.
///
/// ## Availability
///
/// If the engine cannot be created on this platform, the host is still
/// constructed: [`is_available`](Self::is_available) returns false and
/// every execution fails with [`Error::RuntimeUnavailable`].
pub struct WasmHost {
    engine: Option<Engine>,
    /// Error message if engine creation failed.
    engine_error: Option<String>,
    ticker_stop: Arc<AtomicBool>,
}

impl WasmHost {
    /// Creates the engine and starts the epoch ticker.
    pub fn new() -> Self {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.wasm_memory64(false);

        let ticker_stop = Arc::new(AtomicBool::new(false));

        match Engine::new(&config) {
            Ok(engine) => {
                if let Err(e) = spawn_ticker(engine.clone(), Arc::clone(&ticker_stop)) {
                    warn!("Failed to start epoch ticker: {}", e);
                    return Self {
                        engine: None,
                        engine_error: Some(format!("epoch ticker failed to start: {}", e)),
                        ticker_stop,
                    };
                }
                Self {
                    engine: Some(engine),
                    engine_error: None,
                    ticker_stop,
                }
            }
            Err(e) => {
                warn!("Failed to create wasmtime engine: {}", e);
                Self {
                    engine: None,
                    engine_error: Some(format!("engine creation failed: {}", e)),
                    ticker_stop,
                }
            }
        }
    }

    /// Creates a host whose engine is absent, reporting `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            engine: None,
            engine_error: Some(reason.into()),
            ticker_stop: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        self.engine_error.clone()
    }

    fn engine(&self) -> Result<Engine> {
        self.engine.clone().ok_or_else(|| Error::RuntimeUnavailable {
            runtime: RUNTIME_NAME.to_string(),
            reason: self
                .engine_error
                .clone()
                .unwrap_or_else(|| "engine not initialized".to_string()),
        })
    }

    /// Executes `request` under the manifest's permissions and limits.
    ///
    /// Permissions are enforced before any engine resources are allocated.
    /// The returned future resolves with [`Error::Cancelled`] once the
    /// request's token fires, whatever the guest is doing.
    pub async fn execute_with_permissions(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        let engine = self.engine()?;

        let pack_id = request.pack_id.clone();
        let data_dir = request.pack_root.join(crate::constants::PACK_DATA_DIR);
        let preopens =
            permissions::plan_preopens(&pack_id, &data_dir, &request.manifest.permissions)?;

        if request.module_bytes.len() > MAX_WASM_MODULE_SIZE {
            return Err(Error::InvalidModule {
                pack_id,
                reason: format!(
                    "module too large: {} > {} bytes",
                    request.module_bytes.len(),
                    MAX_WASM_MODULE_SIZE
                ),
            });
        }

        if request.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("pack '{}' before start", pack_id)));
        }

        if request.manifest.permissions.network.allow_localhost_listen {
            debug!(pack_id = %pack_id, "allow_localhost_listen requested; no sockets are linked");
        }

        debug!(
            pack_id = %pack_id,
            "Executing '{}' with {} preopens, {} env vars",
            request.entry_function,
            preopens.len(),
            request.env.len()
        );

        run(&engine, request, preopens).await
    }
}

impl Default for WasmHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WasmHost {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}

fn spawn_ticker(engine: Engine, stop: Arc<AtomicBool>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("packrun-epoch".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(EPOCH_TICK);
                engine.increment_epoch();
            }
        })
        .map(|_| ())
}

/// Reads a module file, bounded by [`MAX_WASM_MODULE_SIZE`].
pub fn read_module(pack_id: &str, path: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_WASM_MODULE_SIZE as u64 {
        return Err(Error::InvalidModule {
            pack_id: pack_id.to_string(),
            reason: format!("module too large: {} > {} bytes", meta.len(), MAX_WASM_MODULE_SIZE),
        });
    }
    Ok(std::fs::read(path)?)
}

/// Compiles and runs the module. The module outlives the store.
async fn run(
    engine: &Engine,
    request: ExecutionRequest,
    preopens: Vec<Preopen>,
) -> Result<ExecutionOutput> {
    let module = Module::new(engine, &request.module_bytes).map_err(|e| Error::InvalidModule {
        pack_id: request.pack_id.clone(),
        reason: format!("failed to compile module: {}", e),
    })?;
    debug!(pack_id = %request.pack_id, state = "module-loaded", "Module compiled");

    // Losing the race drops the in-flight future and the store it owns.
    let result = tokio::select! {
        biased;
        _ = request.cancel.cancelled() => {
            debug!(pack_id = %request.pack_id, "Cancelled; dropping store");
            Err(cancelled(&request.pack_id, &request.entry_function))
        }
        result = run_in_store(engine, &module, &request, &preopens) => result,
    };
    drop(module);
    debug!(pack_id = %request.pack_id, state = "torn-down", "Module released");

    match &result {
        Ok(out) => info!(
            pack_id = %request.pack_id,
            "'{}' finished with exit code {} in {:?}",
            request.entry_function,
            out.exit_code,
            out.duration
        ),
        Err(e) => warn!(pack_id = %request.pack_id, "'{}' failed: {}", request.entry_function, e),
    }
    result
}

async fn run_in_store(
    engine: &Engine,
    module: &Module,
    request: &ExecutionRequest,
    preopens: &[Preopen],
) -> Result<ExecutionOutput> {
    let pack_id = request.pack_id.as_str();
    let limits = request.manifest.limits;

    let stdout = MemoryOutputPipe::new(MAX_CAPTURED_OUTPUT);
    let stderr = MemoryOutputPipe::new(MAX_CAPTURED_OUTPUT);

    let wasi = {
        let mut builder = WasiCtxBuilder::new();
        builder
            .stdin(MemoryInputPipe::new(request.input.clone()))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .arg(pack_id);
        for (key, value) in &request.env {
            builder.env(key, value);
        }
        for preopen in preopens {
            let (dir_perms, file_perms) = if preopen.writable {
                (
                    DirPerms::READ | DirPerms::MUTATE,
                    FilePerms::READ | FilePerms::WRITE,
                )
            } else {
                (DirPerms::READ, FilePerms::READ)
            };
            builder
                .preopened_dir(&preopen.host, &preopen.guest, dir_perms, file_perms)
                .map_err(|e| Error::PermissionDenied {
                    pack_id: pack_id.to_string(),
                    reason: format!("failed to preopen '{}': {}", preopen.guest, e),
                })?;
            debug!(pack_id = %pack_id, "Preopened {} -> {}", preopen.guest, preopen.host.display());
        }
        builder.build_p1()
    };

    let memory_limit = limits.memory_bytes();
    let state = HostState {
        wasi,
        limits: StoreLimitsBuilder::new()
            .memory_size(memory_limit)
            .instances(1)
            .build(),
        memory_limit,
    };

    let mut store: Store<HostState> = Store::new(engine, state);
    store.limiter(|s| s as &mut dyn ResourceLimiter);

    let fuel = request.fuel.unwrap_or(DEFAULT_WASM_FUEL);
    store
        .set_fuel(fuel)
        .map_err(|e| Error::Internal(format!("failed to set fuel: {}", e)))?;

    let mut meter = CpuMeter::new(limits.cpu_ms_per_sec.max(0) as u64);
    let cancel = request.cancel.clone();
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_ctx| {
        if cancel.is_cancelled() {
            return Err(anyhow::Error::new(Interrupt::Cancelled));
        }
        if !meter.charge() {
            return Err(anyhow::Error::new(Interrupt::CpuBudget {
                budget_ms: meter.budget_ms,
            }));
        }
        Ok(UpdateDeadline::Yield(1))
    });

    let mut linker: Linker<HostState> = Linker::new(engine);
    p1::add_to_linker_async(&mut linker, |s| &mut s.wasi)
        .map_err(|e| Error::Internal(format!("failed to link WASI: {}", e)))?;

    let started = Instant::now();

    let instance = linker
        .instantiate_async(&mut store, module)
        .await
        .map_err(|e| classify(pack_id, "instantiate", e))?;
    debug!(pack_id = %pack_id, state = "instantiated", "Instance created");

    let func = instance
        .get_func(&mut store, &request.entry_function)
        .ok_or_else(|| Error::InvalidModule {
            pack_id: pack_id.to_string(),
            reason: format!("entry function '{}' is not exported", request.entry_function),
        })?;

    let ty = func.ty(&store);
    if ty.params().next().is_some() {
        return Err(Error::InvalidModule {
            pack_id: pack_id.to_string(),
            reason: format!(
                "entry function '{}' must take no parameters",
                request.entry_function
            ),
        });
    }
    let mut results = vec![Val::I32(0); ty.results().len()];

    debug!(pack_id = %pack_id, state = "running", "Calling '{}'", request.entry_function);
    let exit_code = match func.call_async(&mut store, &[], &mut results).await {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<I32Exit>() {
            Some(exit) => exit.0,
            None => return Err(classify(pack_id, &request.entry_function, e)),
        },
    };
    if request.cancel.is_cancelled() {
        return Err(cancelled(pack_id, &request.entry_function));
    }

    let fuel_consumed = fuel.saturating_sub(store.get_fuel().unwrap_or(0));
    let duration = started.elapsed();
    drop(store);

    Ok(ExecutionOutput {
        exit_code,
        results: results.iter().map(val_to_json).collect(),
        stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.contents()).into_owned(),
        fuel_consumed,
        duration,
    })
}

/// Maps a wasmtime failure onto the crate error taxonomy.
fn classify(pack_id: &str, function: &str, e: anyhow::Error) -> Error {
    if let Some(interrupt) = e.downcast_ref::<Interrupt>() {
        return match interrupt {
            Interrupt::CpuBudget { .. } => Error::ResourceLimitExceeded {
                pack_id: pack_id.to_string(),
                resource: "cpu".to_string(),
                detail: interrupt.to_string(),
            },
            Interrupt::Memory { .. } => Error::ResourceLimitExceeded {
                pack_id: pack_id.to_string(),
                resource: "memory".to_string(),
                detail: interrupt.to_string(),
            },
            Interrupt::Cancelled => cancelled(pack_id, function),
        };
    }

    if let Some(trap) = e.downcast_ref::<Trap>() {
        if *trap == Trap::OutOfFuel {
            return Error::ResourceLimitExceeded {
                pack_id: pack_id.to_string(),
                resource: "cpu".to_string(),
                detail: "fuel exhausted".to_string(),
            };
        }
        return Error::WasmTrap {
            pack_id: pack_id.to_string(),
            function: function.to_string(),
            reason: trap.to_string(),
        };
    }

    if function == "instantiate" {
        return Error::InvalidModule {
            pack_id: pack_id.to_string(),
            reason: format!("failed to instantiate: {:#}", e),
        };
    }

    Error::WasmTrap {
        pack_id: pack_id.to_string(),
        function: function.to_string(),
        reason: format!("{:#}", e),
    }
}

fn cancelled(pack_id: &str, function: &str) -> Error {
    Error::Cancelled(format!("pack '{}' in '{}'", pack_id, function))
}

fn val_to_json(val: &Val) -> serde_json::Value {
    match val {
        Val::I32(v) => serde_json::Value::from(*v),
        Val::I64(v) => serde_json::Value::from(*v),
        Val::F32(bits) => serde_json::Value::from(f32::from_bits(*bits) as f64),
        Val::F64(bits) => serde_json::Value::from(f64::from_bits(*bits)),
        _ => serde_json::Value::Null,
    }
}
