use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use perch_common::{CheckpointStore, Cursor};
use perch_store::SqliteCheckpointStore;

async fn memory_store(retention: u32) -> SqliteCheckpointStore {
    // One connection: each in-memory sqlite connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    let store = SqliteCheckpointStore::new(pool, retention);
    store.migrate().await.expect("migrate");
    store
}

fn cursor(secs: i64, id: &str) -> Cursor {
    Cursor {
        timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        item_id: id.to_string(),
    }
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn load_of_unknown_source_is_empty() {
    let store = memory_store(10).await;
    let cp = store.load("acct").await.unwrap();
    assert!(cp.cursor.is_none());
    assert!(cp.delivered.is_empty());
}

#[tokio::test]
async fn commit_then_load_round_trips() {
    let store = memory_store(10).await;
    store
        .commit("acct", &cursor(3, "C"), &ids(&["A", "B", "C"]))
        .await
        .unwrap();

    let cp = store.load("acct").await.unwrap();
    assert_eq!(cp.cursor, Some(cursor(3, "C")));
    assert_eq!(cp.delivered.len(), 3);
    assert!(cp.delivered.contains("A"));
    assert!(cp.delivered.contains("C"));
}

#[tokio::test]
async fn commit_is_idempotent_under_retry() {
    let store = memory_store(10).await;
    let cur = cursor(3, "C");
    let batch = ids(&["A", "B", "C"]);

    store.commit("acct", &cur, &batch).await.unwrap();
    let first = store.load("acct").await.unwrap();

    store.commit("acct", &cur, &batch).await.unwrap();
    let second = store.load("acct").await.unwrap();

    assert_eq!(first.cursor, second.cursor);
    assert_eq!(first.delivered, second.delivered);
}

#[tokio::test]
async fn cursor_never_rewinds() {
    let store = memory_store(10).await;
    store.commit("acct", &cursor(5, "E"), &ids(&["E"])).await.unwrap();
    store.commit("acct", &cursor(2, "B"), &ids(&["B"])).await.unwrap();

    let cp = store.load("acct").await.unwrap();
    assert_eq!(cp.cursor, Some(cursor(5, "E")));
    // The delivery record still lands even when the cursor stands still.
    assert!(cp.delivered.contains("B"));
}

#[tokio::test]
async fn timestamp_ties_break_by_item_id() {
    let store = memory_store(10).await;
    store.commit("acct", &cursor(5, "10"), &ids(&["10"])).await.unwrap();
    store.commit("acct", &cursor(5, "11"), &ids(&["11"])).await.unwrap();

    let cp = store.load("acct").await.unwrap();
    assert_eq!(cp.cursor, Some(cursor(5, "11")));
}

#[tokio::test]
async fn retention_window_is_bounded() {
    let store = memory_store(3).await;
    store
        .commit("acct", &cursor(1, "C"), &ids(&["A", "B", "C"]))
        .await
        .unwrap();
    store
        .commit("acct", &cursor(2, "E"), &ids(&["D", "E"]))
        .await
        .unwrap();

    let cp = store.load("acct").await.unwrap();
    assert_eq!(cp.delivered.len(), 3);
    // Newest batch survives in full.
    assert!(cp.delivered.contains("D"));
    assert!(cp.delivered.contains("E"));
    assert!(!cp.delivered.contains("A"));
}

#[tokio::test]
async fn sources_are_isolated() {
    let store = memory_store(10).await;
    store.commit("one", &cursor(1, "A"), &ids(&["A"])).await.unwrap();
    store.commit("two", &cursor(9, "Z"), &ids(&["Z"])).await.unwrap();

    let one = store.load("one").await.unwrap();
    let two = store.load("two").await.unwrap();
    assert_eq!(one.cursor, Some(cursor(1, "A")));
    assert!(!one.delivered.contains("Z"));
    assert_eq!(two.cursor, Some(cursor(9, "Z")));
}
