//! Replication plumbing.
//!
//! Leader side: a registry of followers with their replication high-water
//! marks, and fire-and-forget fan-out of freshly appended entries to the
//! healthy subset. Followers recover anything a dropped send loses through
//! the pull path at registration, so a failed send is logged and forgotten.
//!
//! Follower side: idempotent application of replicated batches (CRC-filter,
//! skip known ids, append, apply) plus the registration and gap-pull calls
//! against the leader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use perunkv_core::{HeartbeatService, KeyValueStorage, KvError, LogEntry, Result};

use crate::types::ReplicateAck;

/// Shared replication state for either role.
pub struct ReplicationState {
    /// follower id -> url (leader role).
    followers: RwLock<HashMap<String, String>>,
    /// follower id -> highest id acknowledged (leader role).
    replication_status: RwLock<HashMap<String, u64>>,
    /// Highest id applied locally (follower role).
    last_applied_id: AtomicU64,
    client: reqwest::Client,
    api_timeout: Duration,
}

impl ReplicationState {
    /// Create with the given outbound-call timeout.
    #[must_use]
    pub fn new(api_timeout: Duration) -> Self {
        Self {
            followers: RwLock::new(HashMap::new()),
            replication_status: RwLock::new(HashMap::new()),
            last_applied_id: AtomicU64::new(0),
            client: reqwest::Client::new(),
            api_timeout,
        }
    }

    // -------------------------------------------------------------------
    // Leader side
    // -------------------------------------------------------------------

    /// Track (or re-track) a follower and seed its high-water mark.
    pub fn register_follower(&self, id: &str, url: &str, last_applied_id: u64) {
        self.followers
            .write()
            .insert(id.to_string(), url.to_string());
        self.replication_status
            .write()
            .insert(id.to_string(), last_applied_id);
    }

    /// Snapshot of the follower registry.
    #[must_use]
    pub fn followers(&self) -> HashMap<String, String> {
        self.followers.read().clone()
    }

    /// Snapshot of per-follower replication high-water marks.
    #[must_use]
    pub fn replication_status(&self) -> HashMap<String, u64> {
        self.replication_status.read().clone()
    }

    /// Ship one freshly appended entry to every *healthy* follower,
    /// fire-and-forget. Unhealthy followers are skipped; they catch up via
    /// the pull path once their heartbeats resume.
    pub fn replicate_to_followers(self: &Arc<Self>, heartbeat: &HeartbeatService, entry: &LogEntry) {
        let healthy = heartbeat.healthy_peers();
        let followers = self.followers();
        for (follower_id, url) in followers {
            if !healthy.contains_key(&follower_id) {
                debug!("skipping replication to unhealthy follower {follower_id}");
                continue;
            }
            let state = Arc::clone(self);
            let entry = entry.clone();
            tokio::spawn(async move {
                match state.send_entries(&url, std::slice::from_ref(&entry)).await {
                    Ok(ack) => {
                        state.mark_replicated(&follower_id, entry.id);
                        debug!(
                            "replicated entry {} to {follower_id} (follower at {})",
                            entry.id, ack.last_applied_id
                        );
                    }
                    Err(e) => {
                        warn!("replication of entry {} to {follower_id} failed: {e}", entry.id);
                    }
                }
            });
        }
    }

    /// Record that `follower_id` holds everything up to `entry_id`.
    pub fn mark_replicated(&self, follower_id: &str, entry_id: u64) {
        let mut status = self.replication_status.write();
        let mark = status.entry(follower_id.to_string()).or_insert(0);
        if entry_id > *mark {
            *mark = entry_id;
        }
    }

    async fn send_entries(&self, url: &str, entries: &[LogEntry]) -> Result<ReplicateAck> {
        let response = self
            .client
            .post(format!("{url}/replicate"))
            .timeout(self.api_timeout)
            .json(&json!({ "entries": entries }))
            .send()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KvError::PeerUnavailable(format!(
                "replicate returned {}",
                response.status()
            )));
        }
        response
            .json::<ReplicateAck>()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Follower side
    // -------------------------------------------------------------------

    /// Highest id applied locally.
    #[must_use]
    pub fn last_applied_id(&self) -> u64 {
        self.last_applied_id.load(Ordering::SeqCst)
    }

    /// Raise the local high-water mark (it never moves backwards).
    pub fn observe_applied(&self, id: u64) {
        self.last_applied_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Apply a replicated batch idempotently.
    ///
    /// Entries are sorted by id, CRC-filtered, skipped when already present
    /// in the WAL, appended and applied otherwise. Gaps are accepted: the
    /// reported high-water mark is simply the max applied id, and repair
    /// happens on the next registration cycle.
    pub fn apply_replicated(&self, storage: &KeyValueStorage, mut entries: Vec<LogEntry>) -> u64 {
        entries.sort_by_key(|e| e.id);
        for entry in entries {
            if !entry.validate_crc() {
                warn!("dropping replicated entry {} with bad CRC", entry.id);
                continue;
            }
            if storage.wal().has_entry(entry.id) {
                debug!("skipping already-applied entry {}", entry.id);
                continue;
            }
            match storage.wal().append_entry(entry.clone()) {
                Ok(_) => {
                    storage.apply_entries(std::slice::from_ref(&entry));
                    self.observe_applied(entry.id);
                }
                Err(e) => {
                    warn!("failed to append replicated entry {}: {e}", entry.id);
                }
            }
        }
        self.last_applied_id()
    }

    /// Announce this follower to the leader. Returns the leader's last log
    /// id so the caller can decide whether to pull.
    pub async fn register_with_leader(
        &self,
        leader_url: &str,
        follower_id: &str,
        follower_url: &str,
    ) -> Result<u64> {
        #[derive(serde::Deserialize)]
        struct RegisterResponse {
            last_log_id: u64,
        }

        let body = json!({
            "id": follower_id,
            "url": follower_url,
            "last_applied_id": self.last_applied_id(),
        });
        let response = self
            .client
            .post(format!("{leader_url}/register_follower"))
            .timeout(self.api_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KvError::PeerUnavailable(format!(
                "register_follower returned {}",
                response.status()
            )));
        }
        let parsed: RegisterResponse = response
            .json()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))?;
        Ok(parsed.last_log_id)
    }

    /// Fetch every entry with `id > from_id` from the leader.
    pub async fn pull_from(&self, leader_url: &str, from_id: u64) -> Result<Vec<LogEntry>> {
        #[derive(serde::Deserialize)]
        struct EntriesResponse {
            entries: Vec<LogEntry>,
        }

        let response = self
            .client
            .get(format!("{leader_url}/log_entries/{from_id}"))
            .timeout(self.api_timeout)
            .send()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KvError::PeerUnavailable(format!(
                "log_entries returned {}",
                response.status()
            )));
        }
        let parsed: EntriesResponse = response
            .json()
            .await
            .map_err(|e| KvError::PeerUnavailable(e.to_string()))?;
        Ok(parsed.entries)
    }

    /// Register with the leader and pull whatever the local log is missing.
    /// Used at follower startup and safe to repeat any time.
    pub async fn sync_with_leader(
        &self,
        storage: &KeyValueStorage,
        leader_url: &str,
        follower_id: &str,
        follower_url: &str,
    ) -> Result<u64> {
        let leader_last_id = self
            .register_with_leader(leader_url, follower_id, follower_url)
            .await?;
        if leader_last_id > self.last_applied_id() {
            let entries = self.pull_from(leader_url, self.last_applied_id()).await?;
            let applied = self.apply_replicated(storage, entries);
            debug!("synced with leader: last_applied_id={applied}");
        }
        Ok(self.last_applied_id())
    }
}
