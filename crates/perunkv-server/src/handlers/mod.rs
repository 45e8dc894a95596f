//! HTTP handlers for the PerunKV API.
//!
//! This module organizes handlers by domain:
//! - `health`: liveness check
//! - `keys`: key read/write/delete, history and listing
//! - `replication`: follower registration, log shipping, batch receive
//! - `admin`: heartbeats, compaction control, segments, dedup statistics
//! - `helpers`: shared error responses

pub mod admin;
pub mod health;
pub mod helpers;
pub mod keys;
pub mod replication;

pub use admin::{
    compaction_status, configure_compaction, deduplication_stats, list_segments,
    receive_heartbeat, request_status, run_compaction,
};
pub use health::health_check;
pub use keys::{delete_key, get_key, get_key_history, get_key_versions, list_keys, set_key};
pub use replication::{
    cluster_status, follower_status, get_log_entries, node_status, register_follower, replicate,
};
