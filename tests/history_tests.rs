//! Tests for execution history persistence.

use chrono::{Duration, Utc};
use packrun::{ExecutionHistoryItem, ExecutionStatus, HistoryStore};
use tempfile::TempDir;

fn item(pack_id: &str, minutes_ago: i64, status: ExecutionStatus) -> ExecutionHistoryItem {
    let finished = Utc::now() - Duration::minutes(minutes_ago);
    ExecutionHistoryItem::new(
        pack_id,
        format!("{} pack", pack_id),
        status,
        "out",
        finished - Duration::seconds(2),
        finished,
    )
}

#[test]
fn test_list_is_newest_first_and_filtered() {
    let store = HistoryStore::in_memory();
    store.append(item("a", 30, ExecutionStatus::Success)).unwrap();
    store.append(item("b", 20, ExecutionStatus::Failure)).unwrap();
    store.append(item("a", 10, ExecutionStatus::Cancelled)).unwrap();

    let all = store.list(None).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

    let a = store.list(Some("a")).unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!(a[0].status, ExecutionStatus::Cancelled);
    assert_eq!(a[0].duration_ms, 2000);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/history.jsonl");

    let store = HistoryStore::open(&path).unwrap();
    store
        .append(item("a", 1, ExecutionStatus::Success).with_artifact("pack-a-linux-v1.zip"))
        .unwrap();
    store.append(item("b", 1, ExecutionStatus::Failure)).unwrap();
    drop(store);

    let reopened = HistoryStore::open(&path).unwrap();
    let items = reopened.list(Some("a")).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].artifact.as_deref(), Some("pack-a-linux-v1.zip"));
    assert_eq!(reopened.list(None).unwrap().len(), 2);
}

#[test]
fn test_malformed_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.jsonl");
    let good = serde_json::to_string(&item("a", 1, ExecutionStatus::Success)).unwrap();
    std::fs::write(&path, format!("{{broken\n{}\n\n", good)).unwrap();

    let store = HistoryStore::open(&path).unwrap();
    assert_eq!(store.list(None).unwrap().len(), 1);
}

#[test]
fn test_prune_and_clear_rewrite_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.jsonl");
    let store = HistoryStore::open(&path).unwrap();
    store.append(item("a", 120, ExecutionStatus::Success)).unwrap();
    store.append(item("a", 5, ExecutionStatus::Success)).unwrap();
    store.append(item("b", 5, ExecutionStatus::Success)).unwrap();

    let pruned = store.prune_older_than(Utc::now() - Duration::hours(1)).unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(store.clear(Some("b")).unwrap(), 1);
    assert_eq!(store.clear(Some("b")).unwrap(), 0);

    let reopened = HistoryStore::open(&path).unwrap();
    let items = reopened.list(None).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].pack_id, "a");

    assert_eq!(reopened.clear(None).unwrap(), 1);
    assert!(reopened.list(None).unwrap().is_empty());
}

#[test]
fn test_status_serializes_screaming_case() {
    let json = serde_json::to_string(&ExecutionStatus::Success).unwrap();
    assert_eq!(json, "\"SUCCESS\"");
}
