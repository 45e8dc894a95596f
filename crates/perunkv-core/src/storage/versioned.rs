//! Per-key value with a monotonic version and optional history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current value of a key plus every prior version ever applied.
///
/// `history` stays `None` until the key is updated past its first version, so
/// a map of write-once keys carries no per-key allocation overhead. Retention
/// is unbounded; pruning is a later extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Highest version ever applied.
    pub current_version: u64,
    /// Value at `current_version`.
    pub value: Value,
    /// Prior versions, keyed by version number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HashMap<u64, Value>>,
}

impl VersionedValue {
    /// A value at its first applied version.
    #[must_use]
    pub fn new(current_version: u64, value: Value) -> Self {
        Self {
            current_version,
            value,
            history: None,
        }
    }

    /// Apply a newer version, moving the current value into history.
    ///
    /// Idempotent on monotonic streams: an update whose version is not
    /// strictly greater than `current_version` is ignored, which is what
    /// makes replicated replay safe to repeat.
    pub fn update(&mut self, value: Value, new_version: u64) {
        if new_version <= self.current_version {
            return;
        }
        let previous = std::mem::replace(&mut self.value, value);
        self.history
            .get_or_insert_with(HashMap::new)
            .insert(self.current_version, previous);
        self.current_version = new_version;
    }

    /// Value at `version`, or the current value when `version` is `None`.
    #[must_use]
    pub fn get_value(&self, version: Option<u64>) -> Option<&Value> {
        match version {
            None => Some(&self.value),
            Some(v) if v == self.current_version => Some(&self.value),
            Some(v) => self.history.as_ref()?.get(&v),
        }
    }

    /// Every retained version including the current one.
    #[must_use]
    pub fn full_history(&self) -> HashMap<u64, Value> {
        let mut history = self.history.clone().unwrap_or_default();
        history.insert(self.current_version, self.value.clone());
        history
    }

    /// Retained version numbers, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<u64> {
        let mut versions: Vec<u64> = self
            .history
            .as_ref()
            .map(|h| h.keys().copied().collect())
            .unwrap_or_default();
        versions.push(self.current_version);
        versions.sort_unstable();
        versions
    }
}
