//! # PerunKV Core
//!
//! Durability and replication core of PerunKV, a replicated key-value store
//! with a single configured leader and read-serving followers.
//!
//! ## What lives here
//!
//! - **Segmented WAL**: append-only, size-rolled segments with per-record
//!   CRC-32, corruption-tolerant replay and offline compaction.
//! - **Versioned storage**: an in-memory map over the WAL with per-key
//!   monotonic versions, historical reads and optimistic concurrency control.
//! - **Request deduplication**: at-most-once effect for client retries,
//!   keyed by `(client, request, operation)` with TTL and LRU bounds.
//! - **Heartbeats**: bidirectional liveness tracking that gates replication
//!   to healthy followers.
//! - **Compaction scheduling**: a periodic, non-reentrant driver over WAL
//!   compaction.
//!
//! The HTTP surface, process bootstrap and replication wiring live in
//! `perunkv-server`; everything here is transport-agnostic.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use perunkv_core::{KeyValueStorage, SegmentedWal};
//! use serde_json::json;
//!
//! fn main() -> perunkv_core::Result<()> {
//!     let wal = Arc::new(SegmentedWal::open("data/wal.log", 1024 * 1024)?);
//!     let storage = KeyValueStorage::open(wal);
//!
//!     let (entry, version) = storage.set("greeting", json!("hello"), None)?;
//!     assert_eq!((entry.id, version), (1, 1));
//!     assert_eq!(storage.get("greeting", None), Some(json!("hello")));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod compaction;
pub mod config;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod storage;
pub mod wal;

pub use compaction::{CompactionRun, CompactionService, CompactionStatus};
pub use config::{CompactionConfig, DedupConfig, NodeConfig};
pub use dedup::{DedupStats, RequestDeduplicator};
pub use error::{KvError, Result};
pub use heartbeat::{HeartbeatService, PeerStatus, PeerStatusReport};
pub use storage::{KeyValueStorage, VersionedValue};
pub use wal::{LogEntry, Operation, SegmentedWal};
