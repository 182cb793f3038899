//! Sequential workflow interpreter.

use super::context::{StepOutcome, WorkflowContext};
use super::definition::{StepAction, WorkflowDefinition, WorkflowStep};
use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_ENTRY_FUNCTION, DEFAULT_HTTP_STEP_TIMEOUT, MAX_HTTP_BODY_SIZE,
    MAX_HTTP_REDIRECTS,
};
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::logbuffer::{LogBuffer, LogLevel};
use crate::manifest::{PackType, relative_path_violation};
use crate::pack::Pack;
use crate::permissions::network_allows;
use crate::remote::map_reqwest_error;
use crate::sandbox::{self, ExecutionRequest, WasmHost};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event published by an `emit_event` step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEvent {
    pub pack_id: String,
    pub instance_id: Option<u64>,
    pub name: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    /// Workflow name.
    pub workflow: String,
    pub steps_executed: usize,
    /// Step outputs in execution order.
    pub outputs: Vec<(String, Value)>,
    /// Output of the final step.
    pub last: Option<Value>,
}

/// Per-run inputs that are not part of the workflow document.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Environment handed to `wasm_call` guests.
    pub env: Vec<(String, String)>,
    pub cancel: CancellationToken,
    /// While the watched value is true the run waits at the next step
    /// boundary.
    pub pause: Option<watch::Receiver<bool>>,
}

impl RunOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }
}

/// Executes workflow definitions one step at a time.
///
/// ## Semantics
///
/// - The definition is validated before any step runs.
/// - Steps run strictly in declaration order; a step never overlaps the
///   next.
/// - Every outcome, success or failure, is recorded in the context before
///   the engine decides whether to continue.
/// - The first failing step aborts the run with [`Error::StepFailed`].
///   Effects of earlier steps (KV writes, emitted events) are kept.
/// - Cancellation is observed at each step boundary and inside sleeps,
///   HTTP requests and WASM calls, and ends the run with
///   [`Error::Cancelled`].
pub struct WorkflowEngine {
    kv: Arc<dyn KeyValueStore>,
    host: Arc<WasmHost>,
    logs: LogBuffer,
    http: reqwest::Client,
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowEngine {
    pub fn new(kv: Arc<dyn KeyValueStore>, host: Arc<WasmHost>, logs: LogBuffer) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("packrun/", env!("CARGO_PKG_VERSION")))
            // Redirects are followed in `http_step` so each hop is checked.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            kv,
            host,
            logs,
            http,
            events,
        })
    }

    /// Receives events from `emit_event` steps of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn host(&self) -> &Arc<WasmHost> {
        &self.host
    }

    /// Runs `workflow` on behalf of `pack`, recording into `context`.
    pub async fn execute(
        &self,
        pack: &Pack,
        workflow: &WorkflowDefinition,
        context: &mut WorkflowContext,
        options: &RunOptions,
    ) -> Result<WorkflowResult> {
        workflow.validate()?;

        let pack_id = pack.id.as_str();
        let cancel = &options.cancel;
        let mut pause = options.pause.clone();

        info!(pack_id = %pack_id, "Running workflow '{}' ({} steps)", workflow.name, workflow.steps.len());
        self.logs.push(
            LogLevel::Info,
            pack_id,
            format!("workflow '{}' started", workflow.name),
        );

        let mut outputs = Vec::with_capacity(workflow.steps.len());

        for step in &workflow.steps {
            wait_while_paused(&mut pause, cancel).await?;
            if cancel.is_cancelled() {
                self.logs.push(
                    LogLevel::Warn,
                    pack_id,
                    format!("workflow '{}' cancelled before step '{}'", workflow.name, step.id),
                );
                return Err(Error::Cancelled(format!(
                    "workflow '{}' before step '{}'",
                    workflow.name, step.id
                )));
            }

            debug!(pack_id = %pack_id, step = %step.id, kind = step.action.kind(), "Executing step");

            match self.run_step(pack, step, context, options).await {
                Ok(value) => {
                    context.record(&step.id, StepOutcome::Success(value.clone()));
                    outputs.push((step.id.clone(), value));
                }
                Err(e) => {
                    context.record(&step.id, StepOutcome::Failure(e.to_string()));
                    if let Error::Cancelled(_) = e {
                        self.logs.push(
                            LogLevel::Warn,
                            pack_id,
                            format!("workflow '{}' cancelled in step '{}'", workflow.name, step.id),
                        );
                        return Err(e);
                    }
                    warn!(pack_id = %pack_id, step = %step.id, "Step failed: {}", e);
                    self.logs.push(
                        LogLevel::Error,
                        pack_id,
                        format!("step '{}' failed: {}", step.id, e),
                    );
                    return Err(Error::StepFailed {
                        step_id: step.id.clone(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        info!(pack_id = %pack_id, "Workflow '{}' completed", workflow.name);
        self.logs.push(
            LogLevel::Info,
            pack_id,
            format!("workflow '{}' completed", workflow.name),
        );

        let last = outputs.last().map(|(_, v)| v.clone());
        Ok(WorkflowResult {
            workflow: workflow.name.clone(),
            steps_executed: outputs.len(),
            outputs,
            last,
        })
    }

    async fn run_step(
        &self,
        pack: &Pack,
        step: &WorkflowStep,
        context: &WorkflowContext,
        options: &RunOptions,
    ) -> Result<Value> {
        let cancel = &options.cancel;
        match &step.action {
            StepAction::Http {
                method,
                url,
                headers,
                body,
                timeout_ms,
            } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_HTTP_STEP_TIMEOUT);
                self.http_step(pack, method, url, headers, body.as_ref(), timeout, cancel)
                    .await
            }
            StepAction::WasmCall {
                module,
                function,
                input_from,
            } => {
                let input = input_from
                    .as_deref()
                    .and_then(|id| context.value(id))
                    .map(stdin_bytes)
                    .unwrap_or_default();
                self.wasm_step(
                    pack,
                    module.as_deref(),
                    function.as_deref().unwrap_or(DEFAULT_ENTRY_FUNCTION),
                    input,
                    options,
                )
                .await
            }
            StepAction::KvPut { key, value } => {
                let serialized = serde_json::to_string(value)?;
                self.kv.put(&pack.id, key, &serialized).await?;
                Ok(Value::Bool(true))
            }
            StepAction::KvGet { key } => match self.kv.get(&pack.id, key).await? {
                Some(stored) => Ok(serde_json::from_str(&stored).unwrap_or(Value::String(stored))),
                None => Ok(Value::Null),
            },
            StepAction::Log { level, message } => {
                let pack_id = pack.id.as_str();
                match level {
                    LogLevel::Trace => trace!(pack_id = %pack_id, "{}", message),
                    LogLevel::Debug => debug!(pack_id = %pack_id, "{}", message),
                    LogLevel::Info => info!(pack_id = %pack_id, "{}", message),
                    LogLevel::Warn => warn!(pack_id = %pack_id, "{}", message),
                    LogLevel::Error => error!(pack_id = %pack_id, "{}", message),
                }
                self.logs.push(*level, pack_id, message.clone());
                Ok(Value::Null)
            }
            StepAction::Sleep { duration_ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(Error::Cancelled(format!("sleep in step '{}'", step.id)))
                    }
                    _ = tokio::time::sleep(Duration::from_millis(*duration_ms)) => Ok(Value::Null),
                }
            }
            StepAction::EmitEvent { name, payload } => {
                let event = WorkflowEvent {
                    pack_id: pack.id.clone(),
                    instance_id: context.instance_id,
                    name: name.clone(),
                    payload: payload.clone(),
                    emitted_at: Utc::now(),
                };
                // No subscribers is not an error.
                let receivers = self.events.send(event).unwrap_or(0);
                debug!(pack_id = %pack.id, "Emitted '{}' to {} receivers", name, receivers);
                Ok(Value::Null)
            }
        }
    }

    /// Performs one HTTP step.
    ///
    /// Redirects are followed by hand, up to [`MAX_HTTP_REDIRECTS`] hops,
    /// and every hop must pass the pack's network allow-list. Credentials
    /// are not forwarded across origins.
    #[allow(clippy::too_many_arguments)]
    async fn http_step(
        &self,
        pack: &Pack,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::InvalidWorkflow(format!("invalid HTTP method '{}'", method)))?;
        let mut current = url::Url::parse(url)
            .map_err(|e| Error::InvalidWorkflow(format!("invalid URL '{}': {}", url, e)))?;
        let mut headers = headers.clone();
        let mut body = body;
        let mut hops = 0;

        let resp = loop {
            if !network_allows(&pack.manifest.permissions, current.as_str()) {
                let reason = if hops == 0 {
                    format!("URL '{}' is not in the network allow-list", current)
                } else {
                    format!(
                        "redirect from '{}' to '{}' is not in the network allow-list",
                        url, current
                    )
                };
                return Err(Error::PermissionDenied {
                    pack_id: pack.id.clone(),
                    reason,
                });
            }

            let mut request = self
                .http
                .request(method.clone(), current.clone())
                .timeout(timeout);
            for (name, value) in &headers {
                request = request.header(name, value);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("request to {}", current)));
                }
                resp = request.send() => resp.map_err(|e| map_reqwest_error(current.as_str(), e))?,
            };

            let status = resp.status();
            if !status.is_redirection() || hops >= MAX_HTTP_REDIRECTS {
                break resp;
            }
            // A redirect without a usable Location surfaces as a 3xx failure.
            let Some(next) = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| current.join(location).ok())
            else {
                break resp;
            };

            hops += 1;
            if status == reqwest::StatusCode::SEE_OTHER
                || (matches!(status.as_u16(), 301 | 302)
                    && method != reqwest::Method::GET
                    && method != reqwest::Method::HEAD)
            {
                method = reqwest::Method::GET;
                body = None;
            }
            if next.origin() != current.origin() {
                headers.retain(|name, _| !is_credential_header(name));
            }
            debug!(pack_id = %pack.id, hop = hops, "Following {} redirect to {}", status, next);
            current = next;
        };

        let final_url = current.to_string();
        let status = resp.status();
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("request to {}", final_url)));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| map_reqwest_error(&final_url, e))?;
            if bytes.len() + chunk.len() > MAX_HTTP_BODY_SIZE {
                return Err(Error::ResourceLimitExceeded {
                    pack_id: pack.id.clone(),
                    resource: "http_body".to_string(),
                    detail: format!(
                        "response from {} exceeds {} bytes",
                        final_url, MAX_HTTP_BODY_SIZE
                    ),
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        if !status.is_success() {
            return Err(Error::Http {
                url: final_url,
                status: status.as_u16(),
            });
        }

        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }

    async fn wasm_step(
        &self,
        pack: &Pack,
        module: Option<&str>,
        function: &str,
        input: Vec<u8>,
        options: &RunOptions,
    ) -> Result<Value> {
        let module = match module {
            Some(m) => m.to_string(),
            None if pack.manifest.pack_type == PackType::Wasm => pack.manifest.entry.clone(),
            None => {
                return Err(Error::InvalidWorkflow(
                    "wasm_call in a workflow pack must name a module".to_string(),
                ));
            }
        };
        if let Some(reason) = relative_path_violation(&module) {
            return Err(Error::PermissionDenied {
                pack_id: pack.id.clone(),
                reason: format!("module path '{}' {}", module, reason),
            });
        }

        let path = pack.install_path.join(&module);
        let pack_id = pack.id.clone();
        let module_bytes = tokio::task::spawn_blocking(move || sandbox::read_module(&pack_id, &path))
            .await
            .map_err(|e| Error::Internal(format!("module read task failed: {}", e)))??;

        let request = ExecutionRequest::new(pack.manifest.clone(), module_bytes, &pack.install_path)
            .with_entry_function(function)
            .with_env(options.env.clone())
            .with_input(input)
            .with_cancel(options.cancel.clone());

        let output = self.host.execute_with_permissions(request).await?;
        if !output.success() {
            return Err(Error::WasmTrap {
                pack_id: pack.id.clone(),
                function: function.to_string(),
                reason: format!("exited with code {}", output.exit_code),
            });
        }

        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "results": output.results,
        }))
    }
}

/// Serializes a recorded value for a guest's stdin. Strings are passed raw.
fn stdin_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// Headers dropped when a redirect changes origin.
fn is_credential_header(name: &str) -> bool {
    ["authorization", "cookie", "proxy-authorization"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

async fn wait_while_paused(
    pause: &mut Option<watch::Receiver<bool>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(rx) = pause else {
        return Ok(());
    };
    while *rx.borrow_and_update() {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("workflow while paused".to_string()));
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    // Sender gone; nobody can resume or keep us paused.
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
