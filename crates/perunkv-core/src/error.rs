//! Error types for the PerunKV core.

use thiserror::Error;

/// Core error types.
///
/// Data-plane errors (WAL writes, version conflicts) surface to the caller;
/// replication and heartbeat failures are absorbed by their services and show
/// up here only when an operation is invoked directly.
#[derive(Error, Debug)]
pub enum KvError {
    /// Key, version, peer or request lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency rejection on SET. Carries the version the
    /// caller lost against.
    #[error("version conflict: current version is {current_version}")]
    VersionConflict {
        /// Version currently stored for the contested key.
        current_version: u64,
    },

    /// CRC mismatch or malformed record. Never fatal on the read path; the
    /// offending record is dropped and the caller continues.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// IO error on the write path (append, rename). Read-path IO failures are
    /// per-segment and logged instead.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A peer could not be reached (replication send, heartbeat, pull).
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Missing or malformed field in a client request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration extraction error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything that should map to a 5xx.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::NotFound("key 'a'".to_string());
        assert_eq!(err.to_string(), "not found: key 'a'");

        let err = KvError::VersionConflict { current_version: 4 };
        assert_eq!(err.to_string(), "version conflict: current version is 4");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KvError = io_err.into();
        assert!(matches!(err, KvError::Io(_)));
    }
}
