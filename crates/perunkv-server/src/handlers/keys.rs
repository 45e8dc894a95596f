//! Key read/write/delete handlers, with request deduplication on all three.
//!
//! When a request carries `client_id` and `request_id`, the cached response
//! of a completed identical request is returned as-is: a client retry over a
//! dropped response observes the same id and the same state transition.
//! Completed *negative* outcomes (a 404 read or delete, a 409 write) are
//! cached the same way, so a retry cannot observe a different answer than
//! the original attempt did. Transient failures are never cached.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use perunkv_core::{KvError, Operation};

use crate::handlers::helpers::{internal_error, not_found};
use crate::types::{KeyParams, SetKeyRequest};
use crate::AppState;

/// Status a cached body replays with. The only error shapes ever cached are
/// the deterministic ones: conflicts (which carry `current_version`) and
/// not-found.
fn replay_status(body: &serde_json::Value) -> StatusCode {
    if body["status"] == "error" {
        if body.get("current_version").is_some() {
            StatusCode::CONFLICT
        } else {
            StatusCode::NOT_FOUND
        }
    } else {
        StatusCode::OK
    }
}

/// Cached-response short circuit for deduplicated requests.
fn cached_response(
    state: &AppState,
    params: &KeyParams,
    operation: Operation,
) -> Option<Response> {
    let client_id = params.client_id.as_deref()?;
    let request_id = params.request_id.as_deref()?;
    state
        .dedup
        .lookup(client_id, request_id, operation)
        .map(|cached| (replay_status(&cached), Json(cached)).into_response())
}

/// Cache the response of a completed request, when the client asked for it.
fn remember(
    state: &AppState,
    params: &KeyParams,
    operation: Operation,
    response: &serde_json::Value,
) {
    if let (Some(client_id), Some(request_id)) = (&params.client_id, &params.request_id) {
        state
            .dedup
            .mark_processed(client_id, request_id, operation, response.clone());
    }
}

/// `GET /key/{key}` - latest or version-addressed read.
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<KeyParams>,
) -> Response {
    if let Some(cached) = cached_response(&state, &params, Operation::Get) {
        return cached;
    }

    match state.storage.get_with_version(&key, params.version) {
        Some((value, version)) => {
            let body = json!({ "key": key, "value": value, "version": version });
            remember(&state, &params, Operation::Get, &body);
            Json(body).into_response()
        }
        None => {
            let message = match (params.version, state.storage.latest_version(&key)) {
                (Some(version), Some(_)) => {
                    format!("Version {version} not found for key '{key}'")
                }
                _ => format!("Key '{key}' not found"),
            };
            let body = json!({ "status": "error", "message": message });
            remember(&state, &params, Operation::Get, &body);
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

/// `PUT /key/{key}` - versioned write with optimistic concurrency, fanned
/// out to healthy followers after local durability.
pub async fn set_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<KeyParams>,
    Json(req): Json<SetKeyRequest>,
) -> Response {
    if let Some(cached) = cached_response(&state, &params, Operation::Set) {
        return cached;
    }

    let storage = Arc::clone(&state.storage);
    let write_key = key.clone();
    let result = tokio::task::spawn_blocking(move || {
        storage.set(&write_key, req.value, req.version)
    })
    .await;

    match result {
        Ok(Ok((entry, version))) => {
            state
                .replication
                .replicate_to_followers(&state.heartbeat, &entry);
            let body = json!({ "status": "ok", "id": entry.id, "key": key, "version": version });
            remember(&state, &params, Operation::Set, &body);
            Json(body).into_response()
        }
        Ok(Err(KvError::VersionConflict { current_version })) => {
            let body = json!({
                "status": "error",
                "message": format!("Version conflict for key '{key}'"),
                "current_version": current_version,
            });
            remember(&state, &params, Operation::Set, &body);
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        Ok(Err(e)) => internal_error("Set", &e),
        Err(e) => internal_error("Set", &e),
    }
}

/// `DELETE /key/{key}` - tombstone write, replicated like a set.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<KeyParams>,
) -> Response {
    if let Some(cached) = cached_response(&state, &params, Operation::Delete) {
        return cached;
    }

    let storage = Arc::clone(&state.storage);
    let delete_key = key.clone();
    let result = tokio::task::spawn_blocking(move || storage.delete(&delete_key)).await;

    match result {
        Ok(Ok(entry)) => {
            state
                .replication
                .replicate_to_followers(&state.heartbeat, &entry);
            let body = json!({ "status": "ok", "id": entry.id });
            remember(&state, &params, Operation::Delete, &body);
            Json(body).into_response()
        }
        Ok(Err(KvError::NotFound(_))) => {
            let body = json!({
                "status": "error",
                "message": format!("Key '{key}' not found"),
            });
            remember(&state, &params, Operation::Delete, &body);
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
        Ok(Err(e)) => internal_error("Delete", &e),
        Err(e) => internal_error("Delete", &e),
    }
}

/// `GET /key/{key}/history` - every retained version with its value.
pub async fn get_key_history(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.storage.version_history(&key) {
        Some(history) => {
            let mut items: Vec<(u64, serde_json::Value)> = history.into_iter().collect();
            items.sort_by_key(|(version, _)| *version);
            let versions: Vec<u64> = items.iter().map(|(version, _)| *version).collect();
            let history: Vec<serde_json::Value> = items
                .into_iter()
                .map(|(version, value)| json!({ "version": version, "value": value }))
                .collect();
            Json(json!({ "key": key, "versions": versions, "history": history })).into_response()
        }
        None => not_found(format!("Key '{key}' not found")),
    }
}

/// `GET /key/{key}/versions` - retained version numbers only.
pub async fn get_key_versions(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match (state.storage.versions(&key), state.storage.latest_version(&key)) {
        (Some(versions), Some(latest_version)) => Json(json!({
            "key": key,
            "versions": versions,
            "latest_version": latest_version,
        }))
        .into_response(),
        _ => not_found(format!("Key '{key}' not found")),
    }
}

/// `GET /keys` - all keys currently present.
pub async fn list_keys(State(state): State<Arc<AppState>>) -> Response {
    let mut keys = state.storage.all_keys();
    keys.sort();
    Json(json!({ "keys": keys, "count": keys.len() })).into_response()
}
