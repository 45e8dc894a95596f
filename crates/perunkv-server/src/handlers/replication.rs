//! Replication endpoints: follower registration and log shipping on the
//! leader, batch receive on the follower.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::types::{FollowerRegistration, ReplicationRequest};
use crate::AppState;

/// `POST /register_follower` (leader).
///
/// Registers the follower for replication fan-out *and* as a heartbeat peer,
/// then reports the leader's last log id so the follower can pull its gap.
pub async fn register_follower(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<FollowerRegistration>,
) -> Response {
    state.replication.register_follower(
        &registration.id,
        &registration.url,
        registration.last_applied_id,
    );
    state
        .heartbeat
        .register_peer(&registration.id, &registration.url);
    tracing::info!(
        "registered follower {} at {} (last_applied_id={})",
        registration.id,
        registration.url,
        registration.last_applied_id
    );
    Json(json!({ "status": "ok", "last_log_id": state.storage.wal().last_id() })).into_response()
}

/// `GET /log_entries/{last_id}` (leader) - every entry with `id > last_id`,
/// CRC-filtered and id-sorted. This is the follower's gap-repair pull.
pub async fn get_log_entries(
    State(state): State<Arc<AppState>>,
    Path(last_id): Path<u64>,
) -> Response {
    let storage = Arc::clone(&state.storage);
    let result =
        tokio::task::spawn_blocking(move || storage.wal().read_from(last_id + 1)).await;
    match result {
        Ok(entries) => Json(json!({ "entries": entries })).into_response(),
        Err(e) => crate::handlers::helpers::internal_error("log_entries", &e),
    }
}

/// `POST /replicate` (follower) - idempotent batch application.
pub async fn replicate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReplicationRequest>,
) -> Response {
    let storage = Arc::clone(&state.storage);
    let replication = Arc::clone(&state.replication);
    let result = tokio::task::spawn_blocking(move || {
        replication.apply_replicated(&storage, request.entries)
    })
    .await;
    match result {
        Ok(last_applied_id) => {
            Json(json!({ "status": "ok", "last_applied_id": last_applied_id })).into_response()
        }
        Err(e) => crate::handlers::helpers::internal_error("replicate", &e),
    }
}

/// `GET /follower_status` (leader) - replication registry with high-water
/// marks.
pub async fn follower_status(State(state): State<Arc<AppState>>) -> Response {
    let followers = state.replication.followers();
    let status = state.replication.replication_status();
    let mut rows: Vec<serde_json::Value> = followers
        .iter()
        .map(|(id, url)| {
            json!({
                "id": id,
                "url": url,
                "last_replicated_id": status.get(id).copied().unwrap_or(0),
            })
        })
        .collect();
    rows.sort_by_key(|row| row["id"].as_str().map(String::from));
    Json(json!({ "followers": rows })).into_response()
}

/// `GET /cluster_status` (leader) - identity, registry and peer liveness in
/// one shot.
pub async fn cluster_status(State(state): State<Arc<AppState>>) -> Response {
    let followers = state.replication.followers();
    let replication = state.replication.replication_status();
    Json(json!({
        "role": state.role,
        "server_id": state.server_id,
        "last_log_id": state.storage.wal().last_id(),
        "key_count": state.storage.key_count(),
        "followers": followers,
        "replication_status": replication,
        "heartbeat": state.heartbeat.all_statuses(),
    }))
    .into_response()
}

/// `GET /status` (follower) - replication progress of this node.
pub async fn node_status(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "follower_id": state.server_id,
        "last_applied_id": state.replication.last_applied_id(),
        "leader_url": state.config.leader_url,
    }))
    .into_response()
}
