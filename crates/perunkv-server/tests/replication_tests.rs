//! Follower-side replication tests: idempotent batch application, gap
//! policy and integrity filtering.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use perunkv_core::{LogEntry, NodeConfig, Operation};
use perunkv_server::{build_follower_router, AppState, NodeRole};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_follower(temp_dir: &TempDir) -> (Router, Arc<AppState>) {
    let mut config = NodeConfig::default();
    config.wal_path = temp_dir.path().join("wal.log");
    config.leader_url = Some("http://localhost:8000".to_string());
    let state = AppState::build(NodeRole::Follower, "follower-1", config).expect("build state");
    (build_follower_router(Arc::clone(&state)), state)
}

fn entry(id: u64, key: &str, value: i64, version: u64) -> LogEntry {
    LogEntry::sealed(id, Operation::Set, key, Some(json!(value)), Some(version))
}

fn replicate_request(entries: &[LogEntry]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/replicate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({ "entries": entries })).expect("serialize"),
        ))
        .expect("build request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("invalid JSON body")
}

// ---------------------------------------------------------------------------
// Idempotent application
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_overlapping_batches_apply_exactly_once() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    let entries: Vec<LogEntry> = (1..=5)
        .map(|i| entry(i, &format!("k{i}"), i64::try_from(i).expect("small"), 1))
        .collect();

    // First batch: 1..3. Second batch overlaps: 2..5.
    let response = app
        .clone()
        .oneshot(replicate_request(&entries[0..3]))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["last_applied_id"], 3);

    let response = app
        .clone()
        .oneshot(replicate_request(&entries[1..5]))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["last_applied_id"], 5);

    // Every entry present exactly once in the follower's log.
    let logged = state.storage.wal().read_from(0);
    let ids: Vec<u64> = logged.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    for i in 1..=5u64 {
        assert_eq!(
            state.storage.get(&format!("k{i}"), None),
            Some(json!(i)),
            "key k{i} must be applied"
        );
    }
}

#[tokio::test]
async fn test_replaying_the_same_batch_changes_nothing() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    let batch = vec![entry(1, "a", 10, 1), entry(2, "a", 20, 2)];
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(replicate_request(&batch))
            .await
            .expect("request");
        let body = body_json(response).await;
        assert_eq!(body["last_applied_id"], 2);
    }

    assert_eq!(state.storage.wal().read_from(0).len(), 2);
    assert_eq!(state.storage.get_with_version("a", None), Some((json!(20), 2)));
}

// ---------------------------------------------------------------------------
// Gap policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gapped_batch_is_applied_and_reported() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    app.clone()
        .oneshot(replicate_request(&[
            entry(1, "a", 1, 1),
            entry(2, "b", 2, 1),
            entry(3, "c", 3, 1),
        ]))
        .await
        .expect("request");

    // The leader ships entry 5; 4 never arrives. The follower applies what
    // it has and reports the max applied id; repair happens via the pull
    // path.
    let response = app
        .clone()
        .oneshot(replicate_request(&[entry(5, "e", 5, 1)]))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["last_applied_id"], 5);
    assert!(state.storage.wal().has_entry(5));
    assert!(!state.storage.wal().has_entry(4));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .expect("build request"),
        )
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["follower_id"], "follower-1");
    assert_eq!(body["last_applied_id"], 5);
}

// ---------------------------------------------------------------------------
// Integrity filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tampered_entry_is_dropped() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    let good = entry(1, "good", 1, 1);
    let mut bad = entry(2, "bad", 2, 1);
    bad.value = Some(json!("tampered-in-flight"));

    let response = app
        .clone()
        .oneshot(replicate_request(&[good, bad]))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["last_applied_id"], 1);
    assert_eq!(state.storage.get("good", None), Some(json!(1)));
    assert_eq!(state.storage.get("bad", None), None);
    assert!(!state.storage.wal().has_entry(2));
}

#[tokio::test]
async fn test_unordered_batch_is_applied_in_id_order() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    // Network reordering within one batch: later ids first.
    let batch = vec![entry(3, "k", 30, 3), entry(1, "k", 10, 1), entry(2, "k", 20, 2)];
    let response = app
        .clone()
        .oneshot(replicate_request(&batch))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["last_applied_id"], 3);

    assert_eq!(state.storage.get_with_version("k", None), Some((json!(30), 3)));
    assert_eq!(state.storage.get("k", Some(1)), Some(json!(10)));
}

// ---------------------------------------------------------------------------
// Tombstones
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replicated_delete_removes_key() {
    let temp_dir = TempDir::new().expect("temp dir");
    let (app, state) = create_follower(&temp_dir);

    let batch = vec![
        entry(1, "gone", 1, 1),
        LogEntry::sealed(2, Operation::Delete, "gone", None, None),
    ];
    app.clone()
        .oneshot(replicate_request(&batch))
        .await
        .expect("request");

    assert_eq!(state.storage.get("gone", None), None);
    assert!(state.storage.all_keys().is_empty());
}
