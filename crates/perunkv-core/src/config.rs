//! Node configuration.
//!
//! Every knob is overridable in three layers, later layers winning:
//! built-in defaults, a `perunkv.toml` file in the working directory, and
//! `PERUNKV_*` environment variables (nested keys separated by `__`, e.g.
//! `PERUNKV_COMPACTION__INTERVAL_SECS=900`).

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Default maximum segment size: 1 MiB.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Configuration for a single PerunKV node (leader or follower).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base path for WAL segment files; segments are created as
    /// `<wal_path>.segment.<N>`.
    pub wal_path: PathBuf,
    /// Maximum size of a WAL segment in bytes before rollover.
    pub max_segment_size: u64,
    /// Timeout for outbound HTTP calls (replication, heartbeats, pulls).
    pub api_timeout_secs: u64,
    /// Heartbeat send/monitor period. The liveness timeout is always three
    /// times this value.
    pub heartbeat_interval_secs: u64,
    /// Log compaction scheduling.
    pub compaction: CompactionConfig,
    /// Client-request deduplication cache.
    pub dedup: DedupConfig,
    /// URL of the leader; required by followers, ignored by the leader.
    pub leader_url: Option<String>,
    /// This follower's identity, as registered with the leader.
    pub follower_id: Option<String>,
    /// This follower's externally reachable URL.
    pub follower_url: Option<String>,
}

/// Compaction scheduler settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether the periodic driver runs at all.
    pub enabled: bool,
    /// Sleep between scheduled compaction attempts.
    pub interval_secs: u64,
    /// Minimum spacing between two non-forced runs.
    pub min_interval_secs: u64,
}

/// Deduplication cache settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Total cached responses across all clients.
    pub max_cache_size: usize,
    /// TTL from insertion, in seconds.
    pub expiry_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("data/wal.log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            api_timeout_secs: 5,
            heartbeat_interval_secs: 10,
            compaction: CompactionConfig::default(),
            dedup: DedupConfig::default(),
            leader_url: None,
            follower_id: None,
            follower_url: None,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            min_interval_secs: 600,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 10_000,
            expiry_seconds: 3600,
        }
    }
}

impl NodeConfig {
    /// Load configuration from defaults, `perunkv.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::figment().extract().map_err(|e| KvError::Config(e.to_string()))
    }

    /// The figment used by [`NodeConfig::load`], exposed so binaries can
    /// merge CLI arguments on top.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("perunkv.toml"))
            .merge(Env::prefixed("PERUNKV_").split("__"))
    }

    /// Outbound call timeout as a [`Duration`].
    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Heartbeat send/monitor period as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Liveness threshold: a peer silent for longer than this is down.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 3)
    }
}
