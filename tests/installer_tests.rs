//! Tests for the install pipeline.
//!
//! Downloads go to a local HTTP stub; local archives go through
//! `install_from_file`.

mod common;

use common::{hello_wasm, manifest, serve, write_pack, write_zip};
use packrun::checksum::digest_file;
use packrun::{
    Error, HttpFetcher, InstallSource, PackInstaller, PackStore, PackType, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn installer(root: &TempDir) -> PackInstaller {
    let store = Arc::new(PackStore::with_path(root.path().join("store")).unwrap());
    let fetcher = Arc::new(HttpFetcher::new().unwrap());
    PackInstaller::new(store, fetcher).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        multiplier: 2,
    })
}

fn is_lower_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

// =============================================================================
// Remote Installs
// =============================================================================

#[tokio::test]
async fn test_prod_wasm_install_over_http() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let archive = write_pack(
        work.path(),
        "pack-demo-linux-v1.0.0.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    let expected = digest_file(&archive).unwrap();
    let (base, requests) = serve(200, std::fs::read(&archive).unwrap()).await;

    let installer = installer(&root).with_bearer_token("s3cret");
    let result = installer
        .install(InstallSource::prod(
            "v1.0.0",
            format!("{}/releases/pack-demo-linux-v1.0.0.zip", base),
            expected.to_uppercase(),
        ))
        .await
        .unwrap();

    assert_eq!(result.pack.id, "demo");
    assert_eq!(result.pack.pack_type, PackType::Wasm);
    assert_eq!(result.manifest.limits.memory_mb, 64);
    assert_eq!(result.manifest.limits.cpu_ms_per_sec, 100);
    assert!(is_lower_hex_64(&result.checksum));
    assert_eq!(result.checksum, expected);
    assert!(result.pack.entry_path().is_file());
    assert!(result.pack.install_path.join("pack.json").is_file());

    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(
        seen[0].to_ascii_lowercase().contains("authorization: bearer s3cret"),
        "bearer token should be sent"
    );

    assert_eq!(installer.get("demo").unwrap().checksum, expected);
}

#[tokio::test]
async fn test_invalid_filename_fails_before_download() {
    let root = TempDir::new().unwrap();
    let (base, requests) = serve(200, Vec::new()).await;

    let err = installer(&root)
        .install(InstallSource::dev("main", format!("{}/demo.zip", base)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidPackFilename { .. }));
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_prod_without_checksum_fails_before_download() {
    let root = TempDir::new().unwrap();
    let (base, requests) = serve(200, Vec::new()).await;

    let err = installer(&root)
        .install(InstallSource::Prod {
            tag: "v1.0.0".to_string(),
            url: format!("{}/pack-demo-linux-v1.0.0.zip", base),
            checksum: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChecksumRequired { .. }));
    assert!(requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_installs_nothing() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let archive = write_pack(
        work.path(),
        "pack-demo-linux-v1.0.0.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    let (base, _) = serve(200, std::fs::read(&archive).unwrap()).await;

    let installer = installer(&root);
    let err = installer
        .install(InstallSource::prod(
            "v1.0.0",
            format!("{}/pack-demo-linux-v1.0.0.zip", base),
            "0".repeat(64),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert!(err.is_security());
    assert!(matches!(installer.get("demo"), Err(Error::PackNotFound(_))));
    assert!(installer.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_http_404_is_not_retried() {
    let root = TempDir::new().unwrap();
    let (base, requests) = serve(404, b"missing".to_vec()).await;

    let err = installer(&root)
        .install(InstallSource::dev(
            "main",
            format!("{}/pack-demo-linux-v1.0.0.zip", base),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Http { status: 404, .. }));
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_http_503_is_retried() {
    let root = TempDir::new().unwrap();
    let (base, requests) = serve(503, Vec::new()).await;

    let err = installer(&root)
        .install(InstallSource::dev(
            "main",
            format!("{}/pack-demo-linux-v1.0.0.zip", base),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Http { status: 503, .. }));
    assert_eq!(requests.lock().unwrap().len(), 2);
}

// =============================================================================
// Local Archives
// =============================================================================

#[tokio::test]
async fn test_zip_slip_entry_is_rejected() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let manifest = serde_json::to_vec(&manifest("demo", "wasm", "main.wasm")).unwrap();
    let wasm = hello_wasm();
    let archive = work.path().join("pack-demo-linux-v1.0.0.zip");
    write_zip(
        &archive,
        &[
            ("pack.json", manifest.as_slice()),
            ("main.wasm", wasm.as_slice()),
            ("../../evil", b"pwned".as_slice()),
        ],
    );

    let installer = installer(&root);
    let err = installer
        .install_from_file(&archive, InstallSource::dev("main", "local"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PathTraversal { .. }));
    assert!(!root.path().join("evil").exists());
    assert!(!root.path().join("store").join("evil").exists());
    assert!(installer.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_manifest() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let archive = work.path().join("pack-demo-linux-v1.0.0.zip");
    let wasm = hello_wasm();
    write_zip(&archive, &[("main.wasm", wasm.as_slice())]);

    let err = installer(&root)
        .install_from_file(&archive, InstallSource::dev("main", "local"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ManifestMissing));
}

#[tokio::test]
async fn test_missing_entry() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let manifest = serde_json::to_vec(&manifest("demo", "wasm", "main.wasm")).unwrap();
    let archive = work.path().join("pack-demo-linux-v1.0.0.zip");
    write_zip(&archive, &[("pack.json", manifest.as_slice())]);

    let err = installer(&root)
        .install_from_file(&archive, InstallSource::dev("main", "local"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntryMissing { ref entry } if entry == "main.wasm"));
}

#[tokio::test]
async fn test_invalid_manifest_is_reported_by_field() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut bad = manifest("demo", "wasm", "main.wasm");
    bad["limits"]["memory_mb"] = serde_json::json!(0);
    let archive = write_pack(
        work.path(),
        "pack-demo-linux-v1.0.0.zip",
        &bad,
        "main.wasm",
        &hello_wasm(),
    );

    let err = installer(&root)
        .install_from_file(&archive, InstallSource::dev("main", "local"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidManifest { ref field, .. } if field == "limits.memory_mb"));
}

#[tokio::test]
async fn test_reinstall_replaces_previous_version() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let installer = installer(&root);

    let v1 = write_pack(
        work.path(),
        "pack-demo-linux-v1.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    installer
        .install_from_file(&v1, InstallSource::dev("main", "local"))
        .await
        .unwrap();

    let mut m2 = manifest("demo", "wasm", "main.wasm");
    m2["version"] = serde_json::json!("2.0.0");
    let v2 = write_pack(work.path(), "pack-demo-linux-v2.zip", &m2, "main.wasm", &hello_wasm());
    let result = installer
        .install_from_file(&v2, InstallSource::dev("main", "local"))
        .await
        .unwrap();

    assert_eq!(result.pack.version, "2.0.0");
    assert_eq!(installer.list().unwrap().len(), 1);
    assert_eq!(installer.get("demo").unwrap().version, "2.0.0");
}

#[tokio::test]
async fn test_failed_reinstall_keeps_previous_version() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let installer = installer(&root);

    let v1 = write_pack(
        work.path(),
        "pack-demo-linux-v1.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    let first = installer
        .install_from_file(&v1, InstallSource::dev("main", "local"))
        .await
        .unwrap();

    let manifest = serde_json::to_vec(&manifest("demo", "wasm", "main.wasm")).unwrap();
    let broken = work.path().join("pack-demo-linux-v2.zip");
    write_zip(&broken, &[("pack.json", manifest.as_slice())]);
    assert!(
        installer
            .install_from_file(&broken, InstallSource::dev("main", "local"))
            .await
            .is_err()
    );

    let current = installer.get("demo").unwrap();
    assert_eq!(current.checksum, first.checksum);
    assert!(current.entry_path().is_file());
}

#[tokio::test]
async fn test_concurrent_same_id_installs_stay_consistent() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let installer = Arc::new(installer(&root));

    let mut m2 = manifest("demo", "wasm", "main.wasm");
    m2["version"] = serde_json::json!("2.0.0");
    let a = write_pack(
        work.path(),
        "pack-demo-linux-v1.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    let b = write_pack(work.path(), "pack-demo-linux-v2.zip", &m2, "main.wasm", &hello_wasm());

    let (ra, rb) = tokio::join!(
        installer.install_from_file(&a, InstallSource::dev("main", "local")),
        installer.install_from_file(&b, InstallSource::dev("main", "local")),
    );
    ra.unwrap();
    rb.unwrap();

    let record = installer.get("demo").unwrap();
    let on_disk: serde_json::Value = serde_json::from_slice(
        &std::fs::read(record.install_path.join("pack.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk["version"], serde_json::json!(record.version));
    assert!(record.entry_path().is_file());
    assert_eq!(installer.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_uninstall() {
    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let installer = installer(&root);
    let archive = write_pack(
        work.path(),
        "pack-demo-linux-v1.zip",
        &manifest("demo", "wasm", "main.wasm"),
        "main.wasm",
        &hello_wasm(),
    );
    let result = installer
        .install_from_file(&archive, InstallSource::dev("main", "local"))
        .await
        .unwrap();

    installer.uninstall("demo").await.unwrap();
    assert!(!result.pack.install_path.exists());
    assert!(matches!(installer.get("demo"), Err(Error::PackNotFound(_))));
}
