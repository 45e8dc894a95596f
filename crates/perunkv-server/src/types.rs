//! Request and response bodies for the PerunKV HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use perunkv_core::LogEntry;

/// Error body shared by every endpoint. `current_version` is only present on
/// optimistic-concurrency conflicts.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always `"error"`.
    pub status: &'static str,
    /// Human-readable cause.
    pub message: String,
    /// Version the write lost against, on 409 responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
}

impl ErrorResponse {
    /// Plain error body.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            current_version: None,
        }
    }

    /// Conflict body carrying the winning version.
    pub fn conflict(message: impl Into<String>, current_version: u64) -> Self {
        Self {
            status: "error",
            message: message.into(),
            current_version: Some(current_version),
        }
    }
}

/// Body of `PUT /key/{key}`.
#[derive(Debug, Deserialize)]
pub struct SetKeyRequest {
    /// Arbitrary JSON payload to store.
    pub value: Value,
    /// Optimistic-concurrency token: must beat the current version.
    pub version: Option<u64>,
}

/// Query parameters accepted by the key endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct KeyParams {
    /// Read a specific version instead of the latest.
    pub version: Option<u64>,
    /// Client identity for request deduplication.
    pub client_id: Option<String>,
    /// Client-chosen request id for deduplication.
    pub request_id: Option<String>,
}

/// Body of `POST /register_follower`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FollowerRegistration {
    /// Follower identity.
    pub id: String,
    /// Externally reachable follower URL.
    pub url: String,
    /// Highest id the follower has applied; the leader replies with its own
    /// last log id so the follower can pull the gap.
    #[serde(default)]
    pub last_applied_id: u64,
}

/// Body of `POST /replicate`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicationRequest {
    /// Entries to append and apply, leader ids preserved.
    pub entries: Vec<LogEntry>,
}

/// Response of `POST /replicate` and `GET /log_entries/{last_id}` parsing.
#[derive(Debug, Deserialize)]
pub struct ReplicateAck {
    /// Highest id the follower has applied.
    pub last_applied_id: u64,
}

/// Body of `POST /heartbeat`.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Sender identity.
    pub server_id: String,
    /// Sender clock, unix seconds; echoed back.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Body of `POST /compaction/configure`.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigureCompactionRequest {
    /// Enable or disable the periodic driver.
    pub enabled: Option<bool>,
    /// New scheduling interval, clamped to at least 60 seconds.
    pub interval_seconds: Option<u64>,
}

/// Query parameters of `POST /compaction/run`.
#[derive(Debug, Default, Deserialize)]
pub struct CompactionRunParams {
    /// Ignore the minimum-interval throttle.
    #[serde(default)]
    pub force: bool,
}

/// Query parameters of `GET /request_status`.
#[derive(Debug, Deserialize)]
pub struct RequestStatusParams {
    /// Client identity.
    pub client_id: String,
    /// Request id to look up.
    pub request_id: String,
    /// Operation the request used; all operations are checked when absent.
    pub operation: Option<String>,
}
