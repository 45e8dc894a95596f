//! Versioned key-value storage on top of the segmented WAL.
//!
//! The in-memory map is rebuilt from the log on open and kept in lockstep
//! with it afterwards: every mutation appends to the WAL inside the same
//! critical section that updates the map, so readers see either the pre- or
//! post-write value, never a torn one.

pub mod versioned;


use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::error::{KvError, Result};
use crate::wal::{LogEntry, Operation, SegmentedWal};

pub use versioned::VersionedValue;

/// In-memory map over the WAL with per-key versioning and optimistic
/// concurrency control.
pub struct KeyValueStorage {
    wal: Arc<SegmentedWal>,
    data: RwLock<HashMap<String, VersionedValue>>,
}

impl KeyValueStorage {
    /// Build storage over `wal`, replaying the whole log to reconstruct the
    /// key map.
    #[must_use]
    pub fn open(wal: Arc<SegmentedWal>) -> Self {
        let storage = Self {
            wal,
            data: RwLock::new(HashMap::new()),
        };
        storage.replay_log();
        storage
    }

    /// The WAL this storage writes through.
    #[must_use]
    pub fn wal(&self) -> &SegmentedWal {
        &self.wal
    }

    fn replay_log(&self) {
        let entries = self.wal.read_from(0);
        info!("replaying {} entries from WAL", entries.len());
        let mut data = self.data.write();
        for entry in &entries {
            Self::apply_to(&mut data, entry);
        }
        info!(
            "finished replay, data store contains {} keys",
            data.len()
        );
    }

    /// Apply one entry to the map. SET inserts or updates at the entry's
    /// version (1 when absent); DELETE removes the key and all its versions.
    fn apply_to(data: &mut HashMap<String, VersionedValue>, entry: &LogEntry) {
        match entry.operation {
            Operation::Set => {
                let version = entry.version.unwrap_or(1);
                let value = entry.value.clone().unwrap_or(Value::Null);
                match data.entry(entry.key.clone()) {
                    MapEntry::Occupied(mut occupied) => occupied.get_mut().update(value, version),
                    MapEntry::Vacant(vacant) => {
                        vacant.insert(VersionedValue::new(version, value));
                    }
                }
            }
            Operation::Delete => {
                data.remove(&entry.key);
            }
            Operation::Get => {}
        }
    }

    /// Set a key, appending to the WAL and updating the map.
    ///
    /// `expected_version` is the client's optimistic-concurrency token: on an
    /// existing key, anything not strictly greater than the current version
    /// is rejected with [`KvError::VersionConflict`] and nothing is written.
    /// On a new key, an expected version greater than 1 is honored so a
    /// replicated stream replays deterministically.
    ///
    /// Returns the appended entry and the version actually assigned.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        expected_version: Option<u64>,
    ) -> Result<(LogEntry, u64)> {
        let mut data = self.data.write();

        let next_version = match data.get(key) {
            None => match expected_version {
                Some(requested) if requested > 1 => requested,
                _ => 1,
            },
            Some(existing) => {
                let current = existing.current_version;
                if let Some(requested) = expected_version {
                    if requested <= current {
                        return Err(KvError::VersionConflict {
                            current_version: current,
                        });
                    }
                }
                current + 1
            }
        };

        let entry = self
            .wal
            .append(Operation::Set, key, Some(value.clone()), Some(next_version))?;

        match data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => occupied.get_mut().update(value, next_version),
            MapEntry::Vacant(vacant) => {
                vacant.insert(VersionedValue::new(next_version, value));
            }
        }

        Ok((entry, next_version))
    }

    /// Value of `key` at `version` (latest when `None`).
    #[must_use]
    pub fn get(&self, key: &str, version: Option<u64>) -> Option<Value> {
        self.data.read().get(key)?.get_value(version).cloned()
    }

    /// Value plus the version it resolves to.
    #[must_use]
    pub fn get_with_version(&self, key: &str, version: Option<u64>) -> Option<(Value, u64)> {
        let data = self.data.read();
        let versioned = data.get(key)?;
        let value = versioned.get_value(version)?.clone();
        let actual_version = version.unwrap_or(versioned.current_version);
        Some((value, actual_version))
    }

    /// Remove a key entirely, appending a tombstone.
    pub fn delete(&self, key: &str) -> Result<LogEntry> {
        let mut data = self.data.write();
        if !data.contains_key(key) {
            return Err(KvError::NotFound(format!("key '{key}'")));
        }
        let entry = self.wal.append(Operation::Delete, key, None, None)?;
        data.remove(key);
        Ok(entry)
    }

    /// Apply an externally-sourced batch (follower replay). Entries are
    /// applied in the given order; the caller pre-sorts by id. Stale SETs are
    /// silently ignored by the versioned update, so repeating a batch is a
    /// no-op.
    ///
    /// Returns the id of the last entry in the batch, or 0 for an empty one.
    pub fn apply_entries(&self, entries: &[LogEntry]) -> u64 {
        let mut data = self.data.write();
        let mut last_id = 0;
        for entry in entries {
            Self::apply_to(&mut data, entry);
            last_id = entry.id;
        }
        last_id
    }

    /// Every retained version of `key`, including the current one.
    #[must_use]
    pub fn version_history(&self, key: &str) -> Option<HashMap<u64, Value>> {
        Some(self.data.read().get(key)?.full_history())
    }

    /// Retained version numbers of `key`, ascending.
    #[must_use]
    pub fn versions(&self, key: &str) -> Option<Vec<u64>> {
        Some(self.data.read().get(key)?.versions())
    }

    /// Latest version of `key`.
    #[must_use]
    pub fn latest_version(&self, key: &str) -> Option<u64> {
        Some(self.data.read().get(key)?.current_version)
    }

    /// All keys currently present.
    #[must_use]
    pub fn all_keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Number of keys currently present.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    /// Compact the underlying WAL. Returns
    /// `(segments_compacted, entries_removed)`.
    pub fn compact(&self) -> Result<(usize, u64)> {
        self.wal.compact()
    }
}
