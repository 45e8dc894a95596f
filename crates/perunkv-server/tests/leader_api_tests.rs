//! Leader API integration tests over in-process routers.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use perunkv_core::NodeConfig;
use perunkv_server::{build_leader_router, AppState, NodeRole};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_leader_app(temp_dir: &TempDir) -> Router {
    let mut config = NodeConfig::default();
    config.wal_path = temp_dir.path().join("wal.log");
    config.max_segment_size = 512;
    let state = AppState::build(NodeRole::Leader, "leader", config).expect("build state");
    build_leader_router(state)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("serialize")))
        .expect("build request")
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("invalid JSON body")
}

// ---------------------------------------------------------------------------
// Write / read / delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_set_get_delete_roundtrip() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let response = app
        .clone()
        .oneshot(json_request("PUT", "/key/a", json!({"value": "1"})))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["id"], 1);
    assert_eq!(body["version"], 1);

    let response = app.clone().oneshot(get("/key/a")).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["key"], "a");
    assert_eq!(body["value"], "1");
    assert_eq!(body["version"], 1);

    let response = app.clone().oneshot(delete("/key/a")).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], 2);

    let response = app.clone().oneshot(get("/key/a")).await.expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_get_missing_key_is_404() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let response = app.oneshot(get("/key/ghost")).await.expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_missing_key_is_404() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let response = app.oneshot(delete("/key/ghost")).await.expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_versioned_reads_and_history() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for value in ["1", "2", "3"] {
        let response = app
            .clone()
            .oneshot(json_request("PUT", "/key/a", json!({"value": value})))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(get("/key/a?version=1"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["value"], "1");
    assert_eq!(body["version"], 1);

    let response = app
        .clone()
        .oneshot(get("/key/a?version=9"))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(get("/key/a/history"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["versions"], json!([1, 2, 3]));
    assert_eq!(body["history"][2], json!({"version": 3, "value": "3"}));

    let response = app
        .clone()
        .oneshot(get("/key/a/versions"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["latest_version"], 3);
}

#[tokio::test]
async fn test_version_conflict_is_409_with_current_version() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for value in ["x", "y"] {
        app.clone()
            .oneshot(json_request("PUT", "/key/k", json!({"value": value})))
            .await
            .expect("request");
    }

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/key/k",
            json!({"value": "z", "version": 1}),
        ))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["current_version"], 2);

    // The rejected write left no trace.
    let response = app.clone().oneshot(get("/key/k")).await.expect("request");
    let body = body_json(response).await;
    assert_eq!(body["value"], "y");
}

// ---------------------------------------------------------------------------
// Request deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_retried_put_returns_cached_response() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let uri = "/key/dup?client_id=c1&request_id=r1";
    let first = app
        .clone()
        .oneshot(json_request("PUT", uri, json!({"value": "v"})))
        .await
        .expect("request");
    let first_body = body_json(first).await;

    let retry = app
        .clone()
        .oneshot(json_request("PUT", uri, json!({"value": "v"})))
        .await
        .expect("request");
    let retry_body = body_json(retry).await;

    // Same id, same state transition: the retry hit the cache.
    assert_eq!(first_body, retry_body);
    let response = app.clone().oneshot(get("/key/dup")).await.expect("request");
    let body = body_json(response).await;
    assert_eq!(body["version"], 1, "retry must not bump the version");

    let response = app
        .clone()
        .oneshot(get("/deduplication_stats"))
        .await
        .expect("request");
    let stats = body_json(response).await;
    assert_eq!(stats["same_op_duplicates"], 1);
}

#[tokio::test]
async fn test_retried_failed_get_returns_cached_404() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let uri = "/key/late?client_id=c1&request_id=r1";
    let first = app.clone().oneshot(get(uri)).await.expect("request");
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let first_body = body_json(first).await;

    // Another writer creates the key between the attempt and the retry.
    app.clone()
        .oneshot(json_request("PUT", "/key/late", json!({"value": "v"})))
        .await
        .expect("request");

    // The retry replays the original outcome, status included.
    let retry = app.clone().oneshot(get(uri)).await.expect("request");
    assert_eq!(retry.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(retry).await, first_body);

    // A fresh read (different request id) sees the new value.
    let fresh = app
        .clone()
        .oneshot(get("/key/late?client_id=c1&request_id=r2"))
        .await
        .expect("request");
    assert_eq!(fresh.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_retried_conflicting_put_returns_cached_409() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for value in ["x", "y"] {
        app.clone()
            .oneshot(json_request("PUT", "/key/k", json!({"value": value})))
            .await
            .expect("request");
    }

    let uri = "/key/k?client_id=c1&request_id=r1";
    let first = app
        .clone()
        .oneshot(json_request("PUT", uri, json!({"value": "z", "version": 1})))
        .await
        .expect("request");
    assert_eq!(first.status(), StatusCode::CONFLICT);
    let first_body = body_json(first).await;
    assert_eq!(first_body["current_version"], 2);

    let retry = app
        .clone()
        .oneshot(json_request("PUT", uri, json!({"value": "z", "version": 1})))
        .await
        .expect("request");
    assert_eq!(retry.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(retry).await, first_body);
}

#[tokio::test]
async fn test_request_status_reports_processed_requests() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    app.clone()
        .oneshot(json_request(
            "PUT",
            "/key/a?client_id=c1&request_id=r1",
            json!({"value": 1}),
        ))
        .await
        .expect("request");

    let response = app
        .clone()
        .oneshot(get("/request_status?client_id=c1&request_id=r1"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["status"], "processed");
    assert_eq!(body["operation"], "SET");
    assert_eq!(body["result"]["id"], 1);

    let response = app
        .clone()
        .oneshot(get("/request_status?client_id=c1&request_id=unknown"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["status"], "unknown");
}

// ---------------------------------------------------------------------------
// Replication surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_follower_and_log_entries() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for i in 1..=4 {
        app.clone()
            .oneshot(json_request(
                "PUT",
                &format!("/key/k{i}"),
                json!({"value": i}),
            ))
            .await
            .expect("request");
    }

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/register_follower",
            json!({"id": "follower-1", "url": "http://localhost:8001", "last_applied_id": 2}),
        ))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["last_log_id"], 4);

    // The follower pulls everything past its own high-water mark.
    let response = app
        .clone()
        .oneshot(get("/log_entries/2"))
        .await
        .expect("request");
    let body = body_json(response).await;
    let entries = body["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], 3);
    assert_eq!(entries[1]["id"], 4);

    let response = app
        .clone()
        .oneshot(get("/follower_status"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["followers"][0]["id"], "follower-1");
    assert_eq!(body["followers"][0]["last_replicated_id"], 2);

    let response = app
        .clone()
        .oneshot(get("/cluster_status"))
        .await
        .expect("request");
    let body = body_json(response).await;
    assert_eq!(body["role"], "leader");
    assert_eq!(body["last_log_id"], 4);
}

// ---------------------------------------------------------------------------
// Operational endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_heartbeat_endpoint_echoes_sender() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let response = app
        .oneshot(json_request(
            "POST",
            "/heartbeat",
            json!({"server_id": "follower-1", "timestamp": 1234}),
        ))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["server_id"], "follower-1");
    assert_eq!(body["timestamp"], 1234);
}

#[tokio::test]
async fn test_segments_endpoint_reflects_layout() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for i in 0..30 {
        app.clone()
            .oneshot(json_request(
                "PUT",
                &format!("/key/k{i}"),
                json!({"value": format!("padding-{i}")}),
            ))
            .await
            .expect("request");
    }

    let response = app.oneshot(get("/segments")).await.expect("request");
    let body = body_json(response).await;
    let segments = body["segments"].as_array().expect("segments");
    assert!(segments.len() > 1);
    assert_eq!(body["total_segments"], segments.len());
    assert_eq!(body["max_segment_size"], 512);
    let active_count = segments
        .iter()
        .filter(|s| s["is_active"] == true)
        .count();
    assert_eq!(active_count, 1);
}

#[tokio::test]
async fn test_compaction_endpoints() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    for i in 0..30 {
        app.clone()
            .oneshot(json_request("PUT", "/key/hot", json!({"value": i})))
            .await
            .expect("request");
    }

    let response = app
        .clone()
        .oneshot(json_request("POST", "/compaction/run?force=true", json!({})))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["segments_compacted"].as_u64().expect("count") > 0);
    assert!(body["entries_removed"].as_u64().expect("count") > 0);

    // Compaction must not disturb the visible value.
    let response = app.clone().oneshot(get("/key/hot")).await.expect("request");
    let body = body_json(response).await;
    assert_eq!(body["value"], 29);
    assert_eq!(body["version"], 30);

    let response = app
        .clone()
        .oneshot(get("/compaction/status"))
        .await
        .expect("request");
    let status = body_json(response).await;
    assert_eq!(status["compaction_history"].as_array().expect("history").len(), 1);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/compaction/configure",
            json!({"enabled": false, "interval_seconds": 10}),
        ))
        .await
        .expect("request");
    let status = body_json(response).await;
    assert_eq!(status["enabled"], false);
    assert_eq!(status["compaction_interval_seconds"], 60, "clamped to one minute");
}

#[tokio::test]
async fn test_health_and_keys() {
    let temp_dir = TempDir::new().expect("temp dir");
    let app = create_leader_app(&temp_dir);

    let response = app.clone().oneshot(get("/health")).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["role"], "leader");

    app.clone()
        .oneshot(json_request("PUT", "/key/b", json!({"value": 2})))
        .await
        .expect("request");
    app.clone()
        .oneshot(json_request("PUT", "/key/a", json!({"value": 1})))
        .await
        .expect("request");

    let response = app.clone().oneshot(get("/keys")).await.expect("request");
    let body = body_json(response).await;
    assert_eq!(body["keys"], json!(["a", "b"]));
    assert_eq!(body["count"], 2);
}
