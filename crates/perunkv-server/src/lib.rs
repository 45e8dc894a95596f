//! PerunKV HTTP server: transport layer over the `perunkv-core` durability
//! and replication core.
//!
//! Two roles share one state shape and most of the surface. The leader
//! accepts writes and fans them out to registered, healthy followers; a
//! follower serves reads, receives replicated batches and pulls gaps from
//! the leader at registration time.

pub mod handlers;
pub mod replication;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use perunkv_core::{
    CompactionService, HeartbeatService, KeyValueStorage, NodeConfig, RequestDeduplicator,
    SegmentedWal,
};

pub use handlers::*;
pub use replication::ReplicationState;
pub use types::ErrorResponse;

/// Which half of the replication protocol this process speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts writes, ships the log.
    Leader,
    /// Serves reads, replays the log.
    Follower,
}

/// Server-scoped context injected into every handler.
///
/// Constructed once at startup (init-before-serve) and shared via `Arc`;
/// there are no process-wide singletons.
pub struct AppState {
    /// Role of this node.
    pub role: NodeRole,
    /// Identity used in heartbeats and status payloads.
    pub server_id: String,
    /// Effective configuration.
    pub config: NodeConfig,
    /// Versioned storage over the WAL.
    pub storage: Arc<KeyValueStorage>,
    /// Client-retry deduplication.
    pub dedup: Arc<RequestDeduplicator>,
    /// Peer liveness tracking.
    pub heartbeat: Arc<HeartbeatService>,
    /// Background compaction driver.
    pub compaction: Arc<CompactionService>,
    /// Replication registry and clients.
    pub replication: Arc<ReplicationState>,
}

impl AppState {
    /// Open the WAL, replay storage and wire up every service from `config`.
    ///
    /// Background tasks are *not* started here; binaries start them after
    /// construction so tests can drive the services directly.
    pub fn build(
        role: NodeRole,
        server_id: impl Into<String>,
        config: NodeConfig,
    ) -> perunkv_core::Result<Arc<Self>> {
        let server_id = server_id.into();
        let wal = Arc::new(SegmentedWal::open(&config.wal_path, config.max_segment_size)?);
        let storage = Arc::new(KeyValueStorage::open(wal));
        let dedup = Arc::new(RequestDeduplicator::new(
            config.dedup.max_cache_size,
            config.dedup.expiry_seconds,
            server_id.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            match role {
                NodeRole::Leader => "leader",
                NodeRole::Follower => "follower",
            },
            server_id.clone(),
            config.heartbeat_interval(),
            config.api_timeout(),
        ));
        let compaction = Arc::new(CompactionService::new(
            Arc::clone(&storage),
            config.compaction,
        ));
        let replication = Arc::new(ReplicationState::new(config.api_timeout()));
        // A rebooted follower resumes from whatever its own log already holds.
        replication.observe_applied(storage.wal().last_id());

        Ok(Arc::new(Self {
            role,
            server_id,
            config,
            storage,
            dedup,
            heartbeat,
            compaction,
            replication,
        }))
    }
}

/// Routes served by the leader.
pub fn build_leader_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/key/{key}",
            get(get_key).put(set_key).delete(delete_key),
        )
        .route("/key/{key}/history", get(get_key_history))
        .route("/key/{key}/versions", get(get_key_versions))
        .route("/keys", get(list_keys))
        .route("/register_follower", post(register_follower))
        .route("/log_entries/{last_id}", get(get_log_entries))
        .route("/follower_status", get(follower_status))
        .route("/cluster_status", get(cluster_status))
        .route("/heartbeat", post(receive_heartbeat))
        .route("/compaction/run", post(run_compaction))
        .route("/compaction/status", get(compaction_status))
        .route("/compaction/configure", post(configure_compaction))
        .route("/segments", get(list_segments))
        .route("/deduplication_stats", get(deduplication_stats))
        .route("/request_status", get(request_status))
        .with_state(state)
}

/// Routes served by a follower: the read surface plus `replicate`.
pub fn build_follower_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/key/{key}", get(get_key))
        .route("/key/{key}/history", get(get_key_history))
        .route("/key/{key}/versions", get(get_key_versions))
        .route("/keys", get(list_keys))
        .route("/replicate", post(replicate))
        .route("/status", get(node_status))
        .route("/heartbeat", post(receive_heartbeat))
        .route("/compaction/run", post(run_compaction))
        .route("/compaction/status", get(compaction_status))
        .route("/compaction/configure", post(configure_compaction))
        .route("/segments", get(list_segments))
        .route("/deduplication_stats", get(deduplication_stats))
        .route("/request_status", get(request_status))
        .with_state(state)
}
