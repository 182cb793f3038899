//! Tests for the WASM sandbox.
//!
//! Guests are written in WAT and compiled with `wat`.

mod common;

use common::{hello_wasm, manifest};
use packrun::{Error, ExecutionRequest, PackManifest, WasmHost};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn request(wat: &str, limits: serde_json::Value, pack_root: &TempDir) -> ExecutionRequest {
    let mut doc = manifest("guest", "wasm", "main.wasm");
    doc["limits"] = limits;
    let manifest = PackManifest::from_json(&doc.to_string()).unwrap();
    ExecutionRequest::new(manifest, wat::parse_str(wat).unwrap(), pack_root.path())
}

fn default_limits() -> serde_json::Value {
    json!({ "memory_mb": 64, "cpu_ms_per_sec": 100 })
}

const SPIN_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (loop $spin (br $spin))))
"#;

// =============================================================================
// Normal Execution
// =============================================================================

#[tokio::test]
async fn test_stdout_is_captured() {
    let root = TempDir::new().unwrap();
    let manifest = PackManifest::from_json(&manifest("guest", "wasm", "main.wasm").to_string()).unwrap();
    let host = WasmHost::new();
    assert!(host.is_available(), "{:?}", host.unavailable_reason());

    let out = host
        .execute_with_permissions(ExecutionRequest::new(manifest, hello_wasm(), root.path()))
        .await
        .unwrap();

    assert!(out.success());
    assert_eq!(out.stdout, "hello\n");
    assert!(out.fuel_consumed > 0);
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let root = TempDir::new().unwrap();
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))
"#;
    let out = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap();
    assert_eq!(out.exit_code, 3);
    assert!(!out.success());
}

#[tokio::test]
async fn test_custom_entry_function_results() {
    let root = TempDir::new().unwrap();
    let wat = r#"
(module
  (func (export "answer") (result i32) (i32.const 42)))
"#;
    let out = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root).with_entry_function("answer"))
        .await
        .unwrap();
    assert_eq!(out.results, vec![json!(42)]);
}

#[tokio::test]
async fn test_missing_entry_function_is_invalid_module() {
    let root = TempDir::new().unwrap();
    let wat = r#"(module (func (export "other")))"#;
    let err = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidModule { .. }));
}

#[tokio::test]
async fn test_entry_with_parameters_is_invalid_module() {
    let root = TempDir::new().unwrap();
    let wat = r#"(module (func (export "_start") (param i32)))"#;
    let err = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidModule { .. }));
}

#[tokio::test]
async fn test_unreachable_is_a_trap() {
    let root = TempDir::new().unwrap();
    let wat = r#"(module (func (export "_start") unreachable))"#;
    let err = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WasmTrap { ref function, .. } if function == "_start"));
}

// =============================================================================
// Limits
// =============================================================================

#[tokio::test]
async fn test_cpu_budget_stops_spinning_guest() {
    let root = TempDir::new().unwrap();
    let err = WasmHost::new()
        .execute_with_permissions(request(SPIN_WAT, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ResourceLimitExceeded { ref resource, .. } if resource == "cpu"),
        "unexpected: {}",
        err
    );
}

#[tokio::test]
async fn test_fuel_exhaustion_is_cpu_limit() {
    let root = TempDir::new().unwrap();
    let limits = json!({ "memory_mb": 64, "cpu_ms_per_sec": 1000 });
    let err = WasmHost::new()
        .execute_with_permissions(request(SPIN_WAT, limits, &root).with_fuel(10_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded { ref resource, .. } if resource == "cpu"));
}

#[tokio::test]
async fn test_memory_growth_over_limit_traps() {
    let root = TempDir::new().unwrap();
    // 2048 pages = 128 MiB, over the 64 MiB limit.
    let wat = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (drop (memory.grow (i32.const 2048)))))
"#;
    let err = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ResourceLimitExceeded { ref resource, .. } if resource == "memory"),
        "unexpected: {}",
        err
    );
}

#[tokio::test]
async fn test_memory_growth_within_limit_succeeds() {
    let root = TempDir::new().unwrap();
    let wat = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (drop (memory.grow (i32.const 16)))))
"#;
    let out = WasmHost::new()
        .execute_with_permissions(request(wat, default_limits(), &root))
        .await
        .unwrap();
    assert!(out.success());
}

// =============================================================================
// Cancellation and Availability
// =============================================================================

#[tokio::test]
async fn test_cancel_interrupts_running_guest() {
    let root = TempDir::new().unwrap();
    let limits = json!({ "memory_mb": 64, "cpu_ms_per_sec": 1000 });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = WasmHost::new()
        .execute_with_permissions(request(SPIN_WAT, limits, &root).with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "unexpected: {}", err);
}

/// Guest that parks in `poll_oneoff` on a relative monotonic clock timeout.
fn sleeping_wat(nanos: u64) -> String {
    format!(
        r#"
(module
  (import "wasi_snapshot_preview1" "poll_oneoff"
    (func $poll (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (i32.store8 (i32.const 8) (i32.const 0))
    (i32.store (i32.const 16) (i32.const 1))
    (i64.store (i32.const 24) (i64.const {nanos}))
    (drop (call $poll (i32.const 0) (i32.const 64) (i32.const 1) (i32.const 128)))))
"#
    )
}

#[tokio::test]
async fn test_short_host_sleep_completes() {
    let root = TempDir::new().unwrap();
    let out = WasmHost::new()
        .execute_with_permissions(request(&sleeping_wat(20_000_000), default_limits(), &root))
        .await
        .unwrap();
    assert!(out.success());
    assert!(out.duration >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_cancel_interrupts_guest_blocked_in_host_sleep() {
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = WasmHost::new()
        .execute_with_permissions(
            request(&sleeping_wat(4_000_000_000), default_limits(), &root).with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "unexpected: {}", err);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancel took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = WasmHost::new()
        .execute_with_permissions(request(SPIN_WAT, default_limits(), &root).with_cancel(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
}

#[tokio::test]
async fn test_unavailable_host() {
    let root = TempDir::new().unwrap();
    let host = WasmHost::unavailable("disabled for test");
    assert!(!host.is_available());
    assert_eq!(host.unavailable_reason().as_deref(), Some("disabled for test"));

    let err = host
        .execute_with_permissions(request(SPIN_WAT, default_limits(), &root))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeUnavailable { .. }));
}

#[tokio::test]
async fn test_invalid_grant_denied_before_execution() {
    let root = TempDir::new().unwrap();
    let mut req = request(SPIN_WAT, default_limits(), &root);
    req.manifest.permissions.filesystem.read.push("/etc".to_string());
    let err = WasmHost::new().execute_with_permissions(req).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
}
