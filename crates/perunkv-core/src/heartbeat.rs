//! Peer-to-peer heartbeat liveness tracking.
//!
//! Every node runs two background duties: a monitor that flips peers to
//! `down` after `3 × interval` of silence, and a sender that POSTs a
//! heartbeat to every registered peer - including ones already marked down,
//! so recovery is detected. Sends are fire-and-forget per peer; a slow peer
//! never stalls the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Heard from within the liveness threshold.
    Healthy,
    /// Silent past the threshold; still probed for recovery.
    Down,
}

struct PeerState {
    url: String,
    last_heartbeat: SystemTime,
    status: PeerStatus,
}

/// Status snapshot of one peer, shaped for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatusReport {
    /// Peer base URL.
    pub url: String,
    /// Current liveness state.
    pub status: PeerStatus,
    /// Unix seconds of the last received heartbeat.
    pub last_heartbeat: u64,
    /// Seconds elapsed since then.
    pub seconds_since_last_heartbeat: u64,
}

/// Bidirectional heartbeat tracker and sender.
pub struct HeartbeatService {
    service_name: String,
    server_id: String,
    interval: Duration,
    timeout: Duration,
    api_timeout: Duration,
    client: reqwest::Client,
    peers: RwLock<HashMap<String, PeerState>>,
    monitor_running: AtomicBool,
    sender_running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeartbeatService {
    /// Create a tracker identifying itself as `server_id`. The liveness
    /// threshold is fixed at three send intervals.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        server_id: impl Into<String>,
        interval: Duration,
        api_timeout: Duration,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            server_id: server_id.into(),
            interval,
            timeout: interval * 3,
            api_timeout,
            client: reqwest::Client::new(),
            peers: RwLock::new(HashMap::new()),
            monitor_running: AtomicBool::new(false),
            sender_running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Identity sent with outgoing heartbeats.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Start tracking a peer. Registration counts as a heartbeat.
    pub fn register_peer(&self, id: &str, url: &str) {
        self.peers.write().insert(
            id.to_string(),
            PeerState {
                url: url.to_string(),
                last_heartbeat: SystemTime::now(),
                status: PeerStatus::Healthy,
            },
        );
        info!("{}: registered peer {id} at {url}", self.service_name);
    }

    /// Stop tracking a peer.
    pub fn deregister_peer(&self, id: &str) {
        if self.peers.write().remove(id).is_some() {
            info!("{}: deregistered peer {id}", self.service_name);
        }
    }

    /// Record a heartbeat received from `id`. Returns `false` for unknown
    /// peers, which are logged and otherwise ignored.
    pub fn record_heartbeat(&self, id: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(id) else {
            warn!(
                "{}: received heartbeat from unknown peer {id}",
                self.service_name
            );
            return false;
        };
        peer.last_heartbeat = SystemTime::now();
        if peer.status != PeerStatus::Healthy {
            peer.status = PeerStatus::Healthy;
            info!("{}: peer {id} is healthy again", self.service_name);
        }
        true
    }

    /// Status snapshot of one peer.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<PeerStatusReport> {
        self.peers.read().get(id).map(Self::report)
    }

    /// Status snapshot of every peer.
    #[must_use]
    pub fn all_statuses(&self) -> HashMap<String, PeerStatusReport> {
        self.peers
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), Self::report(state)))
            .collect()
    }

    /// Ids and URLs of peers currently considered healthy. Replication is
    /// gated on this set.
    #[must_use]
    pub fn healthy_peers(&self) -> HashMap<String, String> {
        self.peers
            .read()
            .iter()
            .filter(|(_, state)| state.status == PeerStatus::Healthy)
            .map(|(id, state)| (id.clone(), state.url.clone()))
            .collect()
    }

    /// Start the monitor task. No-op when already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while service.monitor_running.load(Ordering::SeqCst) {
                service.mark_stale_peers_down();
                tokio::time::sleep(service.interval).await;
            }
        });
        self.tasks.lock().push(handle);
        info!("{}: started heartbeat monitoring", self.service_name);
    }

    /// Start the sender task. No-op when already running.
    pub fn start_sending(self: &Arc<Self>) {
        if self.sender_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while service.sender_running.load(Ordering::SeqCst) {
                service.send_heartbeats_to_all();
                tokio::time::sleep(service.interval).await;
            }
        });
        self.tasks.lock().push(handle);
        info!("{}: started sending heartbeats", self.service_name);
    }

    /// Stop both background duties.
    pub fn stop(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
        self.sender_running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("{}: stopped heartbeat service", self.service_name);
    }

    /// One monitor pass: peers silent past the threshold go down.
    fn mark_stale_peers_down(&self) {
        let mut peers = self.peers.write();
        for (id, state) in peers.iter_mut() {
            if state.status == PeerStatus::Down {
                continue;
            }
            let silence = state.last_heartbeat.elapsed().unwrap_or_default();
            if silence > self.timeout {
                state.status = PeerStatus::Down;
                warn!(
                    "{}: peer {id} marked as down, no heartbeat for {:.1}s",
                    self.service_name,
                    silence.as_secs_f64()
                );
            }
        }
    }

    /// One sender pass: fire-and-forget a heartbeat at every peer.
    fn send_heartbeats_to_all(&self) {
        let targets: Vec<(String, String)> = self
            .peers
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.url.clone()))
            .collect();

        for (peer_id, url) in targets {
            let client = self.client.clone();
            let service_name = self.service_name.clone();
            let server_id = self.server_id.clone();
            let api_timeout = self.api_timeout;
            tokio::spawn(async move {
                let body = json!({ "server_id": server_id, "timestamp": unix_now() });
                let result = client
                    .post(format!("{url}/heartbeat"))
                    .timeout(api_timeout)
                    .json(&body)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        debug!("{service_name}: heartbeat sent to {peer_id}");
                    }
                    Ok(response) => {
                        warn!(
                            "{service_name}: heartbeat to {peer_id} failed with status {}",
                            response.status()
                        );
                    }
                    Err(e) => {
                        warn!("{service_name}: failed to send heartbeat to {peer_id}: {e}");
                    }
                }
            });
        }
    }

    fn report(state: &PeerState) -> PeerStatusReport {
        PeerStatusReport {
            url: state.url.clone(),
            status: state.status,
            last_heartbeat: state
                .last_heartbeat
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            seconds_since_last_heartbeat: state.last_heartbeat.elapsed().unwrap_or_default().as_secs(),
        }
    }
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_timeout_zero() -> HeartbeatService {
        // interval 0 => timeout 0: any measurable silence is stale.
        HeartbeatService::new("test", "self", Duration::ZERO, Duration::from_secs(1))
    }

    #[test]
    fn test_registration_starts_healthy() {
        let service =
            HeartbeatService::new("test", "self", Duration::from_secs(10), Duration::from_secs(5));
        service.register_peer("p1", "http://localhost:9001");

        let report = service.status("p1").expect("registered peer");
        assert_eq!(report.status, PeerStatus::Healthy);
        assert_eq!(report.url, "http://localhost:9001");
        assert_eq!(
            service.healthy_peers().get("p1").map(String::as_str),
            Some("http://localhost:9001")
        );
    }

    #[test]
    fn test_stale_peer_goes_down_and_recovers() {
        let service = service_with_timeout_zero();
        service.register_peer("p1", "http://localhost:9001");

        std::thread::sleep(Duration::from_millis(20));
        service.mark_stale_peers_down();
        assert_eq!(service.status("p1").expect("peer").status, PeerStatus::Down);
        assert!(service.healthy_peers().is_empty());

        assert!(service.record_heartbeat("p1"));
        assert_eq!(
            service.status("p1").expect("peer").status,
            PeerStatus::Healthy
        );
    }

    #[test]
    fn test_heartbeat_from_unknown_peer_is_ignored() {
        let service = service_with_timeout_zero();
        assert!(!service.record_heartbeat("nobody"));
        assert!(service.status("nobody").is_none());
    }

    #[test]
    fn test_deregistered_peer_disappears() {
        let service = service_with_timeout_zero();
        service.register_peer("p1", "http://localhost:9001");
        service.deregister_peer("p1");
        assert!(service.status("p1").is_none());
        assert!(service.all_statuses().is_empty());
    }

    #[test]
    fn test_down_peer_stays_down_until_heartbeat() {
        let service = service_with_timeout_zero();
        service.register_peer("p1", "http://localhost:9001");
        std::thread::sleep(Duration::from_millis(20));

        service.mark_stale_peers_down();
        service.mark_stale_peers_down();
        assert_eq!(service.status("p1").expect("peer").status, PeerStatus::Down);
    }
}
