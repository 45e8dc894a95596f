//! Log entry codec: canonical encoding of a single operation with an
//! integrity check.
//!
//! Replication ships entries across processes, so both sides must compute the
//! same CRC from the same logical entry. The CRC input is the entry
//! serialized as compact JSON with object keys sorted and the `crc` field
//! removed; absent optional fields are preserved as explicit `null`s. That
//! form is deterministic and language-agnostic, so independent nodes agree
//! bit-for-bit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KvError, Result};

/// Operation carried by a log entry.
///
/// `Get` exists for the client-request model (deduplication keys include the
/// operation) but is never durably logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Insert or update a key.
    #[serde(rename = "SET")]
    Set,
    /// Remove a key and all its versions.
    #[serde(rename = "DELETE")]
    Delete,
    /// Read a key; request-model only.
    #[serde(rename = "GET")]
    Get,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Set => "SET",
            Operation::Delete => "DELETE",
            Operation::Get => "GET",
        };
        f.write_str(s)
    }
}

/// A single durable operation record.
///
/// `id` is assigned by the leader at append time and preserved verbatim by
/// followers. `version` is the per-key monotonic counter for SET entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing 64-bit counter, unique across all segments.
    pub id: u64,
    /// What this entry does to `key`.
    pub operation: Operation,
    /// Non-empty opaque key.
    pub key: String,
    /// Payload for SET; absent for DELETE.
    pub value: Option<Value>,
    /// Per-key version for SET; may be absent for DELETE and legacy entries.
    pub version: Option<u64>,
    /// CRC-32 (IEEE) over the canonical serialization with this field removed.
    pub crc: Option<u32>,
}

impl LogEntry {
    /// Create an entry without a CRC. Use [`LogEntry::sealed`] for entries
    /// headed to disk.
    #[must_use]
    pub fn new(
        id: u64,
        operation: Operation,
        key: impl Into<String>,
        value: Option<Value>,
        version: Option<u64>,
    ) -> Self {
        Self {
            id,
            operation,
            key: key.into(),
            value,
            version,
            crc: None,
        }
    }

    /// Create an entry with its CRC already computed.
    #[must_use]
    pub fn sealed(
        id: u64,
        operation: Operation,
        key: impl Into<String>,
        value: Option<Value>,
        version: Option<u64>,
    ) -> Self {
        let mut entry = Self::new(id, operation, key, value, version);
        entry.crc = Some(entry.compute_crc());
        entry
    }

    /// Canonical JSON of this entry. `with_crc` controls whether the `crc`
    /// field participates; the CRC input itself never contains it.
    fn canonical_json(&self, with_crc: bool) -> String {
        // BTreeMap gives sorted keys independently of serde_json features.
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("id", Value::from(self.id));
        fields.insert("operation", Value::from(self.operation.to_string()));
        fields.insert("key", Value::from(self.key.clone()));
        fields.insert("value", self.value.clone().unwrap_or(Value::Null));
        fields.insert(
            "version",
            self.version.map_or(Value::Null, Value::from),
        );
        if with_crc {
            fields.insert("crc", self.crc.map_or(Value::Null, Value::from));
        }
        // serde_json cannot fail on a map of plain values.
        serde_json::to_string(&fields).unwrap_or_default()
    }

    /// CRC-32 (IEEE polynomial) over the canonical serialization of this
    /// entry with the `crc` field removed.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(self.canonical_json(false).as_bytes())
    }

    /// `true` iff a CRC is present and matches the entry's content.
    #[must_use]
    pub fn validate_crc(&self) -> bool {
        self.crc == Some(self.compute_crc())
    }

    /// Encode as one newline-terminated record.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut line = self.canonical_json(true);
        line.push('\n');
        line
    }

    /// Decode a single record line.
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| KvError::Integrity(format!("malformed log record: {e}")))
    }
}
