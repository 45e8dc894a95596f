//! Operational endpoints: heartbeat receive, compaction control, segment
//! listing, deduplication statistics.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use perunkv_core::heartbeat::unix_now;
use perunkv_core::Operation;

use crate::handlers::helpers::{bad_request, internal_error};
use crate::types::{CompactionRunParams, ConfigureCompactionRequest, HeartbeatRequest, RequestStatusParams};
use crate::AppState;

/// `POST /heartbeat` - record a peer's heartbeat and echo it.
pub async fn receive_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    state.heartbeat.record_heartbeat(&request.server_id);
    Json(json!({
        "status": "ok",
        "server_id": request.server_id,
        "timestamp": request.timestamp.unwrap_or_else(unix_now),
    }))
    .into_response()
}

/// `POST /compaction/run?force=` - trigger a compaction now.
pub async fn run_compaction(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompactionRunParams>,
) -> Response {
    let compaction = Arc::clone(&state.compaction);
    let result = tokio::task::spawn_blocking(move || compaction.run(params.force)).await;
    match result {
        Ok(Ok((segments_compacted, entries_removed))) => Json(json!({
            "status": "ok",
            "segments_compacted": segments_compacted,
            "entries_removed": entries_removed,
        }))
        .into_response(),
        Ok(Err(e)) => internal_error("Compaction", &e),
        Err(e) => internal_error("Compaction", &e),
    }
}

/// `GET /compaction/status` - scheduler state and recent history.
pub async fn compaction_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.compaction.status()).into_response()
}

/// `POST /compaction/configure` - toggle the driver or retune its interval.
pub async fn configure_compaction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConfigureCompactionRequest>,
) -> Response {
    if let Some(enabled) = request.enabled {
        state.compaction.set_enabled(enabled);
    }
    if let Some(interval) = request.interval_seconds {
        state.compaction.set_interval(interval);
    }
    Json(state.compaction.status()).into_response()
}

/// `GET /segments` - on-disk layout of the WAL.
pub async fn list_segments(State(state): State<Arc<AppState>>) -> Response {
    let wal = state.storage.wal();
    let active = wal.active_segment();
    let segments: Vec<serde_json::Value> = wal
        .segment_files()
        .into_iter()
        .map(|path| {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            json!({
                "path": path.display().to_string(),
                "size": size,
                "is_active": path == active,
            })
        })
        .collect();
    Json(json!({
        "segments": segments,
        "total_segments": segments.len(),
        "max_segment_size": wal.max_segment_size(),
    }))
    .into_response()
}

/// `GET /deduplication_stats` - cache counters.
pub async fn deduplication_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.dedup.stats()).into_response()
}

/// `GET /request_status` - side-effect-free view into the dedup cache.
///
/// With an explicit `operation` only that slot is checked; otherwise every
/// operation is probed, which covers clients that reuse ids across a
/// SET/DELETE cycle.
pub async fn request_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RequestStatusParams>,
) -> Response {
    let operations: Vec<Operation> = match params.operation.as_deref() {
        Some("SET") => vec![Operation::Set],
        Some("DELETE") => vec![Operation::Delete],
        Some("GET") => vec![Operation::Get],
        Some(other) => {
            return bad_request(format!(
                "Unknown operation '{other}'. Valid: SET, DELETE, GET"
            ))
        }
        None => vec![Operation::Set, Operation::Delete, Operation::Get],
    };

    for operation in operations {
        if let Some(result) =
            state
                .dedup
                .peek(&params.client_id, &params.request_id, operation)
        {
            return Json(json!({
                "status": "processed",
                "operation": operation.to_string(),
                "result": result,
            }))
            .into_response();
        }
    }
    Json(json!({ "status": "unknown" })).into_response()
}
