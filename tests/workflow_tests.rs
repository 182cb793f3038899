//! Tests for the workflow engine.

mod common;

use chrono::Utc;
use common::{HELLO_WAT, manifest, serve, serve_with_headers};
use packrun::workflow::{
    RunOptions, StepAction, StepOutcome, WorkflowContext, WorkflowDefinition, WorkflowEngine,
    WorkflowStep,
};
use packrun::{
    Error, InstallSource, KeyValueStore, LogBuffer, LogLevel, MemoryKvStore, Pack, PackManifest,
    PackType, WasmHost,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct Fixture {
    engine: WorkflowEngine,
    kv: Arc<dyn KeyValueStore>,
    logs: LogBuffer,
    pack: Pack,
    _root: TempDir,
}

fn fixture_with(connect: &[String]) -> Fixture {
    let root = TempDir::new().unwrap();
    let mut doc = manifest("flow", "workflow", "flow.json");
    doc["permissions"]["network"]["connect"] = json!(connect);
    let manifest = PackManifest::from_json(&doc.to_string()).unwrap();

    let pack = Pack {
        id: manifest.id.clone(),
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        pack_type: PackType::Workflow,
        manifest,
        source: InstallSource::dev("main", "local"),
        install_path: root.path().to_path_buf(),
        checksum: "0".repeat(64),
        installed_at: Utc::now(),
    };

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let logs = LogBuffer::new(100);
    let engine = WorkflowEngine::new(Arc::clone(&kv), Arc::new(WasmHost::new()), logs.clone()).unwrap();
    Fixture {
        engine,
        kv,
        logs,
        pack,
        _root: root,
    }
}

fn fixture() -> Fixture {
    fixture_with(&[])
}

fn step(id: &str, action: StepAction) -> WorkflowStep {
    WorkflowStep::new(id, action)
}

fn kv_put(key: &str, value: Value) -> StepAction {
    StepAction::KvPut {
        key: key.to_string(),
        value,
    }
}

fn http_get(url: &str) -> StepAction {
    StepAction::Http {
        method: "GET".to_string(),
        url: url.to_string(),
        headers: BTreeMap::new(),
        body: None,
        timeout_ms: Some(5_000),
    }
}

// =============================================================================
// Step Semantics
// =============================================================================

#[tokio::test]
async fn test_log_sleep_kv_round_trip() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "basic",
        vec![
            step(
                "log",
                StepAction::Log {
                    level: LogLevel::Info,
                    message: "starting".to_string(),
                },
            ),
            step("wait", StepAction::Sleep { duration_ms: 10 }),
            step("put", kv_put("k", json!("v"))),
            step(
                "get",
                StepAction::KvGet {
                    key: "k".to_string(),
                },
            ),
        ],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let result = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.steps_executed, 4);
    assert_eq!(result.last, Some(json!("v")));
    assert_eq!(context.step_ids(), vec!["log", "wait", "put", "get"]);
    assert_eq!(context.value("put"), Some(&json!(true)));
    assert!(
        f.logs
            .snapshot()
            .iter()
            .any(|e| e.message == "starting" && e.source == "flow")
    );
}

#[tokio::test]
async fn test_kv_get_of_absent_key_is_null() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "absent",
        vec![step(
            "get",
            StepAction::KvGet {
                key: "nope".to_string(),
            },
        )],
    );
    let mut context = WorkflowContext::new(&f.pack.id, None);
    let result = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.last, Some(Value::Null));
}

#[tokio::test]
async fn test_failure_stops_run_and_keeps_earlier_effects() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "partial",
        vec![
            step("s1", kv_put("first", json!(1))),
            step("s2", http_get("https://not-allowed.example.com/")),
            step("s3", kv_put("third", json!(3))),
        ],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StepFailed { ref step_id, .. } if step_id == "s2"));
    assert_eq!(context.len(), 2);
    assert!(matches!(context.get("s2"), Some(StepOutcome::Failure(_))));
    assert!(context.get("s3").is_none());
    assert_eq!(f.kv.get("flow", "first").await.unwrap().as_deref(), Some("1"));
    assert_eq!(f.kv.get("flow", "third").await.unwrap(), None);
}

#[tokio::test]
async fn test_invalid_definition_runs_no_steps() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "dupes",
        vec![
            step("same", kv_put("a", json!(1))),
            step("same", kv_put("b", json!(2))),
        ],
    );
    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidWorkflow(_)));
    assert!(context.is_empty());
    assert_eq!(f.kv.get("flow", "a").await.unwrap(), None);
}

#[tokio::test]
async fn test_emit_event_reaches_subscribers() {
    let f = fixture();
    let mut events = f.engine.subscribe();
    let workflow = WorkflowDefinition::new(
        "events",
        vec![step(
            "emit",
            StepAction::EmitEvent {
                name: "synced".to_string(),
                payload: json!({ "count": 3 }),
            },
        )],
    );

    let mut context = WorkflowContext::new(&f.pack.id, Some(7));
    f.engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.name, "synced");
    assert_eq!(event.pack_id, "flow");
    assert_eq!(event.instance_id, Some(7));
    assert_eq!(event.payload, json!({ "count": 3 }));
}

// =============================================================================
// Cancellation and Pause
// =============================================================================

#[tokio::test]
async fn test_cancel_during_sleep() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "long",
        vec![
            step("nap", StepAction::Sleep { duration_ms: 60_000 }),
            step("after", kv_put("after", json!(true))),
        ],
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert!(matches!(context.get("nap"), Some(StepOutcome::Failure(_))));
    assert_eq!(f.kv.get("flow", "after").await.unwrap(), None);
}

#[tokio::test]
async fn test_paused_run_waits_for_resume() {
    let f = fixture();
    let workflow = WorkflowDefinition::new("paused", vec![step("put", kv_put("k", json!(1)))]);

    let (tx, rx) = watch::channel(true);
    let options = RunOptions {
        pause: Some(rx),
        ..RunOptions::default()
    };

    let kv = Arc::clone(&f.kv);
    let resume = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = kv.get("flow", "k").await.unwrap();
        tx.send(false).unwrap();
        (before, tx)
    });

    let mut context = WorkflowContext::new(&f.pack.id, None);
    f.engine
        .execute(&f.pack, &workflow, &mut context, &options)
        .await
        .unwrap();

    let (before, _tx) = resume.await.unwrap();
    assert_eq!(before, None, "no step may run while paused");
    assert_eq!(f.kv.get("flow", "k").await.unwrap().as_deref(), Some("1"));
}

// =============================================================================
// HTTP and WASM Steps
// =============================================================================

#[tokio::test]
async fn test_http_step_against_allowed_host() {
    let (base, requests) = serve(200, br#"{"ok":true}"#.to_vec()).await;
    let f = fixture_with(&[base.clone()]);
    let workflow = WorkflowDefinition::new(
        "fetch",
        vec![step("get", http_get(&format!("{}/status", base)))],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let result = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.last, Some(json!({ "status": 200, "body": { "ok": true } })));
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_http_step_error_status_fails_step() {
    let (base, _) = serve(500, b"boom".to_vec()).await;
    let f = fixture_with(&[base.clone()]);
    let workflow = WorkflowDefinition::new(
        "fetch",
        vec![step("get", http_get(&format!("{}/status", base)))],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepFailed { ref cause, .. } if cause.contains("500")));
}

#[tokio::test]
async fn test_http_step_to_undeclared_host_is_denied() {
    let (base, requests) = serve(200, br#"{"ok":true}"#.to_vec()).await;
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "fetch",
        vec![step("get", http_get(&format!("{}/status", base)))],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::StepFailed { ref cause, .. } if cause.contains("allow-list")),
        "unexpected: {}",
        err
    );
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_redirect_to_undeclared_host_is_refused() {
    let (internal, internal_requests) = serve(200, br#"{"secret":1}"#.to_vec()).await;
    let location = format!("{}/internal", internal);
    let (front, front_requests) =
        serve_with_headers(302, &[("Location", location.as_str())], Vec::new()).await;
    let f = fixture_with(&[front.clone()]);
    let workflow = WorkflowDefinition::new(
        "fetch",
        vec![step("get", http_get(&format!("{}/start", front)))],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::StepFailed { ref cause, .. } if cause.contains("redirect")),
        "unexpected: {}",
        err
    );
    assert_eq!(front_requests.lock().unwrap().len(), 1);
    assert!(internal_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_redirect_between_declared_hosts_drops_credentials() {
    let (target, target_requests) = serve(200, br#"{"ok":true}"#.to_vec()).await;
    let location = format!("{}/data", target);
    let (front, front_requests) =
        serve_with_headers(307, &[("Location", location.as_str())], Vec::new()).await;
    let f = fixture_with(&[front.clone(), target.clone()]);

    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_string(), "Bearer t0k".to_string());
    let workflow = WorkflowDefinition::new(
        "fetch",
        vec![step(
            "get",
            StepAction::Http {
                method: "GET".to_string(),
                url: format!("{}/start", front),
                headers,
                body: None,
                timeout_ms: Some(5_000),
            },
        )],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let result = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.last, Some(json!({ "status": 200, "body": { "ok": true } })));
    let front_head = front_requests.lock().unwrap()[0].to_ascii_lowercase();
    assert!(front_head.contains("authorization: bearer t0k"));
    let target_heads = target_requests.lock().unwrap();
    assert_eq!(target_heads.len(), 1);
    assert!(!target_heads[0].to_ascii_lowercase().contains("authorization"));
}

#[tokio::test]
async fn test_wasm_call_step_runs_named_module() {
    let f = fixture();
    let module_dir = f.pack.install_path.join("mods");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(module_dir.join("hello.wasm"), wat::parse_str(HELLO_WAT).unwrap()).unwrap();

    let workflow = WorkflowDefinition::new(
        "wasm",
        vec![step(
            "call",
            StepAction::WasmCall {
                module: Some("mods/hello.wasm".to_string()),
                function: None,
                input_from: None,
            },
        )],
    );

    let mut context = WorkflowContext::new(&f.pack.id, None);
    let result = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap();

    let out = result.last.unwrap();
    assert_eq!(out["exit_code"], json!(0));
    assert_eq!(out["stdout"], json!("hello\n"));
}

#[tokio::test]
async fn test_wasm_call_in_workflow_pack_requires_module() {
    let f = fixture();
    let workflow = WorkflowDefinition::new(
        "wasm",
        vec![step(
            "call",
            StepAction::WasmCall {
                module: None,
                function: None,
                input_from: None,
            },
        )],
    );
    let mut context = WorkflowContext::new(&f.pack.id, None);
    let err = f
        .engine
        .execute(&f.pack, &workflow, &mut context, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StepFailed { ref step_id, .. } if step_id == "call"));
}
