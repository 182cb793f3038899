//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Guest that writes "hello\n" to stdout and returns.
pub const HELLO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

pub fn hello_wasm() -> Vec<u8> {
    wat::parse_str(HELLO_WAT).unwrap()
}

/// Minimal valid manifest.
pub fn manifest(id: &str, pack_type: &str, entry: &str) -> Value {
    json!({
        "schema_version": 1,
        "id": id,
        "name": format!("{} pack", id),
        "version": "1.0.0",
        "type": pack_type,
        "entry": entry,
        "permissions": {
            "filesystem": { "read": [], "write": [] },
            "network": { "connect": [], "allow_localhost_listen": false }
        },
        "limits": { "memory_mb": 64, "cpu_ms_per_sec": 100 },
        "required_env": []
    })
}

/// Writes a zip archive with the given entries.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Writes `<dir>/<filename>` holding `pack.json` plus the entry file.
pub fn write_pack(dir: &Path, filename: &str, manifest: &Value, entry: &str, body: &[u8]) -> PathBuf {
    let path = dir.join(filename);
    let manifest_bytes = serde_json::to_vec_pretty(manifest).unwrap();
    write_zip(&path, &[("pack.json", manifest_bytes.as_slice()), (entry, body)]);
    path
}

/// Serves `body` with `status` to every request. Returns the base URL and
/// the raw request heads received.
pub async fn serve(status: u16, body: Vec<u8>) -> (String, Arc<Mutex<Vec<String>>>) {
    serve_with_headers(status, &[], body).await
}

/// Like [`serve`], adding `headers` to every response.
pub async fn serve_with_headers(
    status: u16,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let extra: String = headers
        .iter()
        .map(|(name, value)| format!("{}: {}\r\n", name, value))
        .collect();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            let extra = extra.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).into_owned());
                let response = format!(
                    "HTTP/1.1 {} Stub\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    extra,
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), requests)
}
