//! Instance lifecycle management.

use super::executor::{EXIT_CANCELLED, PackExecutor, RunReport};
use super::repository::InstanceRepository;
use super::state::{Instance, InstanceState};
use crate::constants::{MAX_RUNNING_INSTANCES, STOP_GRACE_PERIOD};
use crate::error::{Error, Result};
use crate::history::{ExecutionHistoryItem, HistoryStore};
use crate::logbuffer::{LogBuffer, LogLevel};
use crate::pack::Pack;
use crate::secrets::SecretResolver;
use crate::workflow::WorkflowEngine;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Poll interval of [`InstanceManager::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Executor attached to an instance for one run.
struct TrackedRun {
    run_id: Uuid,
    executor: Arc<PackExecutor>,
}

type Tracked = Arc<RwLock<HashMap<u64, TrackedRun>>>;

type RowLocks = Arc<Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>>;

/// Owns instance rows and the executors attached to them.
///
/// ## State Machine
///
/// ```text
///   create ─► Stopped ─start─► Running ◀─pause/resume─▶ Paused
///                ▲                │                        │
///                └──── stop / completion ──────────────────┘
///   Stopped ─delete─► (gone)
/// ```
///
/// ## Concurrency
///
/// Only the manager inserts or removes tracked executors. Each run carries
/// a run id; the reaper only detaches the executor of its own run, so a
/// late completion never evicts a newer start.
///
/// Every read-modify-write of an instance row happens under that
/// instance's row lock. A run's outcome is written by whoever detaches it
/// under the lock: normally the reaper, or `stop_instance` when the run
/// outlives [`STOP_GRACE_PERIOD`]. The other party leaves the row alone.
#[derive(Clone)]
pub struct InstanceManager {
    repository: Arc<dyn InstanceRepository>,
    engine: Arc<WorkflowEngine>,
    history: Arc<HistoryStore>,
    logs: LogBuffer,
    tracked: Tracked,
    row_locks: RowLocks,
}

impl InstanceManager {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        engine: Arc<WorkflowEngine>,
        history: Arc<HistoryStore>,
    ) -> Self {
        let logs = engine.logs().clone();
        Self {
            repository,
            engine,
            history,
            logs,
            tracked: Arc::new(RwLock::new(HashMap::new())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Creates a Stopped instance bound to `pack`. A blank name defaults to
    /// the pack name.
    pub async fn create_instance(&self, pack: &Pack, name: &str) -> Result<Instance> {
        let name = if name.trim().is_empty() {
            pack.name.as_str()
        } else {
            name
        };
        let instance = self.repository.create(&pack.id, name).await?;
        info!(pack_id = %pack.id, instance_id = instance.id, "Created instance '{}'", instance.name);
        Ok(instance)
    }

    pub async fn get_instance(&self, id: u64) -> Result<Instance> {
        self.repository
            .get(id)
            .await?
            .ok_or(Error::InstanceNotFound(id))
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.repository.list().await
    }

    /// Returns true while an executor is attached to `id`.
    pub fn is_tracked(&self, id: u64) -> bool {
        self.tracked
            .read()
            .map(|t| t.contains_key(&id))
            .unwrap_or(false)
    }

    /// Starts a run of `pack` for instance `id` with the given environment.
    ///
    /// Every name in the manifest's `required_env` must be present in `env`;
    /// otherwise [`Error::MissingSecrets`] lists the absent names, sorted.
    /// The row is persisted as Running before the executor is dispatched and
    /// reverted to Stopped if dispatch fails.
    pub async fn start_instance(
        &self,
        id: u64,
        pack: &Pack,
        env: BTreeMap<String, String>,
    ) -> Result<Instance> {
        let mut missing: Vec<String> = pack
            .manifest
            .required_env
            .iter()
            .filter(|name| !env.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(Error::MissingSecrets(missing));
        }

        let row = self.row_lock(id);
        let _row = row.lock().await;
        let mut instance = self.get_instance(id).await?;
        if instance.pack_id != pack.id {
            return Err(Error::InvalidState {
                id,
                state: format!("bound to pack '{}'", instance.pack_id),
                expected: format!("bound to pack '{}'", pack.id),
            });
        }

        let run_id = Uuid::now_v7();
        let executor = Arc::new(PackExecutor::for_pack(
            &self.engine,
            pack,
            id,
            env.into_iter().collect(),
        ));

        {
            let mut tracked = self
                .tracked
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            if tracked.contains_key(&id) {
                return Err(Error::AlreadyRunning(id));
            }
            if tracked.len() >= MAX_RUNNING_INSTANCES {
                return Err(Error::ResourceLimitExceeded {
                    pack_id: pack.id.clone(),
                    resource: "instances".to_string(),
                    detail: format!("{} instances already running", tracked.len()),
                });
            }
            tracked.insert(
                id,
                TrackedRun {
                    run_id,
                    executor: Arc::clone(&executor),
                },
            );
        }

        instance.mark_running();
        if let Err(e) = self.repository.save(&instance).await {
            self.detach(id, run_id);
            return Err(e);
        }

        let handle = match executor.start().await {
            Ok(handle) => handle,
            Err(e) => {
                self.detach(id, run_id);
                warn!(pack_id = %pack.id, instance_id = id, "Dispatch failed: {}", e);
                instance.mark_stopped(None, format!("dispatch failed: {}", e));
                if let Err(save_err) = self.repository.save(&instance).await {
                    error!(instance_id = id, "Failed to revert instance row: {}", save_err);
                }
                self.logs.push(
                    LogLevel::Error,
                    &pack.id,
                    format!("instance {} failed to start: {}", id, e),
                );
                return Err(e);
            }
        };

        info!(pack_id = %pack.id, instance_id = id, run_id = %run_id, "Instance started");
        self.logs.push(
            LogLevel::Info,
            &pack.id,
            format!("instance {} started", id),
        );

        let manager = self.clone();
        let pack_id = pack.id.clone();
        let pack_name = pack.name.clone();
        let started_at = instance.started_at.unwrap_or_else(Utc::now);
        tokio::spawn(async move {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => RunReport::lost(started_at, e.to_string()),
            };
            manager.reap(id, run_id, &pack_id, &pack_name, report).await;
        });

        Ok(instance)
    }

    /// Resolves the pack's `required_env` through `resolver`, then starts.
    pub async fn resolve_and_start(
        &self,
        id: u64,
        pack: &Pack,
        resolver: &dyn SecretResolver,
    ) -> Result<Instance> {
        let env = resolver.resolve(&pack.manifest.required_env);
        debug!(
            pack_id = %pack.id,
            "Resolved {}/{} required secrets",
            env.len(),
            pack.manifest.required_env.len()
        );
        self.start_instance(id, pack, env).await
    }

    pub async fn pause_instance(&self, id: u64) -> Result<Instance> {
        let row = self.row_lock(id);
        let _row = row.lock().await;
        let mut instance = self.get_instance(id).await?;
        if instance.state != InstanceState::Running {
            return Err(Error::InvalidState {
                id,
                state: instance.state.to_string(),
                expected: InstanceState::Running.to_string(),
            });
        }
        if let Some(executor) = self.executor(id)? {
            executor.pause();
        }
        instance.state = InstanceState::Paused;
        self.repository.save(&instance).await?;
        info!(instance_id = id, "Instance paused");
        Ok(instance)
    }

    pub async fn resume_instance(&self, id: u64) -> Result<Instance> {
        let row = self.row_lock(id);
        let _row = row.lock().await;
        let mut instance = self.get_instance(id).await?;
        if instance.state != InstanceState::Paused {
            return Err(Error::InvalidState {
                id,
                state: instance.state.to_string(),
                expected: InstanceState::Paused.to_string(),
            });
        }
        if let Some(executor) = self.executor(id)? {
            executor.resume();
        }
        instance.state = InstanceState::Running;
        self.repository.save(&instance).await?;
        info!(instance_id = id, "Instance resumed");
        Ok(instance)
    }

    /// Cancels the attached run, if any, and marks the row Stopped.
    ///
    /// The run is given [`STOP_GRACE_PERIOD`] to wind down, so on return its
    /// outcome is recorded and the instance can be started again at once.
    /// A run that overstays is detached and recorded as cancelled here.
    /// Stopping a Stopped instance is a no-op.
    pub async fn stop_instance(&self, id: u64) -> Result<Instance> {
        let run = self.tracked_run(id)?;
        if let Some((run_id, executor)) = &run {
            executor.stop();
            self.wait_for_detach(id, *run_id, STOP_GRACE_PERIOD).await;
        }

        let row = self.row_lock(id);
        let _row = row.lock().await;
        let forced = match &run {
            Some((run_id, _)) => self.detach(id, *run_id),
            None => false,
        };
        let mut instance = self.get_instance(id).await?;
        if forced {
            warn!(instance_id = id, "Run did not finish within {:?}; detached", STOP_GRACE_PERIOD);
            instance.mark_stopped(Some(EXIT_CANCELLED), "stopped");
        } else if run.is_some() || instance.state == InstanceState::Stopped {
            // Reaped under the row lock, or never running.
            return Ok(instance);
        } else {
            instance.mark_stopped(None, "stopped");
        }
        self.repository.save(&instance).await?;
        info!(instance_id = id, "Instance stopped");
        self.logs.push(
            LogLevel::Info,
            &instance.pack_id,
            format!("instance {} stopped", id),
        );
        Ok(instance)
    }

    /// Deletes the row, stopping an attached run first.
    pub async fn delete_instance(&self, id: u64) -> Result<()> {
        let row = self.row_lock(id);
        let _row = row.lock().await;
        if let Some(executor) = self.executor(id)? {
            executor.stop();
            if let Ok(mut tracked) = self.tracked.write() {
                tracked.remove(&id);
            }
        }
        if !self.repository.delete(id).await? {
            return Err(Error::InstanceNotFound(id));
        }
        info!(instance_id = id, "Instance deleted");
        if let Ok(mut locks) = self.row_locks.lock() {
            locks.remove(&id);
        }
        Ok(())
    }

    /// Marks rows left Running or Paused by a previous process as Stopped.
    /// Returns how many rows were reset.
    pub async fn recover(&self) -> Result<usize> {
        let mut reset = 0;
        for listed in self.repository.list().await? {
            if !listed.state.is_active() {
                continue;
            }
            let row = self.row_lock(listed.id);
            let _row = row.lock().await;
            if self.is_tracked(listed.id) {
                continue;
            }
            if let Some(mut instance) = self.repository.get(listed.id).await?
                && instance.state.is_active()
            {
                instance.mark_stopped(None, "interrupted");
                self.repository.save(&instance).await?;
                reset += 1;
            }
        }
        if reset > 0 {
            warn!("Reset {} interrupted instances to stopped", reset);
        }
        Ok(reset)
    }

    /// Waits until no run is attached to `id`, then returns its row.
    pub async fn wait(&self, id: u64, timeout: Duration) -> Result<Instance> {
        let deadline = Instant::now() + timeout;
        while self.is_tracked(id) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("waiting for instance {}", id),
                    duration: timeout,
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        // The reaper detaches before writing the row; its lock orders us after.
        let row = self.row_lock(id);
        let _row = row.lock().await;
        self.get_instance(id).await
    }

    fn executor(&self, id: u64) -> Result<Option<Arc<PackExecutor>>> {
        Ok(self.tracked_run(id)?.map(|(_, executor)| executor))
    }

    fn tracked_run(&self, id: u64) -> Result<Option<(Uuid, Arc<PackExecutor>)>> {
        let tracked = self
            .tracked
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(tracked
            .get(&id)
            .map(|t| (t.run_id, Arc::clone(&t.executor))))
    }

    fn is_tracked_run(&self, id: u64, run_id: Uuid) -> bool {
        self.tracked
            .read()
            .map(|t| t.get(&id).is_some_and(|r| r.run_id == run_id))
            .unwrap_or(false)
    }

    /// Polls until `run_id` is no longer attached to `id` or `grace` passes.
    async fn wait_for_detach(&self, id: u64, run_id: Uuid, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.is_tracked_run(id, run_id) && Instant::now() < deadline {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Returns the lock serializing row updates of `id`.
    fn row_lock(&self, id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    fn detach(&self, id: u64, run_id: Uuid) -> bool {
        let mut tracked = self.tracked.write().unwrap_or_else(|p| p.into_inner());
        if tracked.get(&id).is_some_and(|t| t.run_id == run_id) {
            tracked.remove(&id);
            true
        } else {
            false
        }
    }

    /// Records a finished run: history, then row and detach under the row
    /// lock. The row is left alone when the run was already detached.
    async fn reap(&self, id: u64, run_id: Uuid, pack_id: &str, pack_name: &str, report: RunReport) {
        debug!(
            instance_id = id,
            run_id = %run_id,
            status = %report.status,
            "Run finished: {}",
            report.reason
        );

        let item = ExecutionHistoryItem::new(
            pack_id,
            pack_name,
            report.status,
            report.output,
            report.started_at,
            report.finished_at,
        );
        if let Err(e) = self.history.append(item) {
            error!(pack_id = %pack_id, "Failed to append history: {}", e);
        }

        let level = match report.status {
            crate::history::ExecutionStatus::Success => LogLevel::Info,
            _ => LogLevel::Warn,
        };
        self.logs.push(
            level,
            pack_id,
            format!("instance {} finished: {}", id, report.reason),
        );

        let row = self.row_lock(id);
        let _row = row.lock().await;
        if !self.detach(id, run_id) {
            debug!(instance_id = id, run_id = %run_id, "Run already detached; row left unchanged");
            return;
        }
        match self.repository.get(id).await {
            Ok(Some(mut instance)) => {
                instance.mark_stopped(Some(report.exit_code), report.reason);
                if let Err(e) = self.repository.save(&instance).await {
                    error!(instance_id = id, "Failed to record run completion: {}", e);
                }
            }
            Ok(None) => debug!(instance_id = id, "Instance deleted before run finished"),
            Err(e) => error!(instance_id = id, "Failed to load instance: {}", e),
        }
    }
}
