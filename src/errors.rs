//! Error types for the snapshot engine.
//!
//! A single flat enumeration covers every failure kind raised by the
//! content store, metadata store, scanner, engine, and rollback planner.
//! Variants map onto the taxonomy the rest of the crate reasons about
//! (config, io, corruption, not-found, conflict, cancelled) plus two
//! wrapper kinds that the Engine and Planner use to carry a root cause
//! without leaking every inner error type across the public API.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RewindError {
    /// Malformed or out-of-range configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded metadata store failure.
    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    /// JSON (de)serialization failure for manifests and status files.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML (de)serialization failure for the config file.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A blob's recomputed hash disagrees with its key, or a manifest
    /// references a blob that is not present.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A snapshot id, blob, or bookmark is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rollback encountered a non-auto-resolvable content divergence.
    /// Only used where a conflict cannot be represented in the returned
    /// plan/result type (see `RollbackResult` for the normal path).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A background worker or long scan observed the stop signal.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// `create_snapshot` failed after step 3; carries the root cause.
    #[error("failed to create snapshot: {0}")]
    SnapshotCreate(#[source] Box<RewindError>),

    /// `execute` (rollback) failed; carries the root cause.
    #[error("rollback failed: {0}")]
    Rollback(#[source] Box<RewindError>),
}

impl RewindError {
    pub fn snapshot_create(cause: RewindError) -> Self {
        RewindError::SnapshotCreate(Box::new(cause))
    }

    pub fn rollback(cause: RewindError) -> Self {
        RewindError::Rollback(Box::new(cause))
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        RewindError::Corruption(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RewindError::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RewindError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RewindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_preserves_source_message() {
        let cause = RewindError::corruption("hash mismatch for ab12");
        let wrapped = RewindError::snapshot_create(cause);
        assert!(wrapped.to_string().contains("hash mismatch"));
    }

    #[test]
    fn not_found_formats_message() {
        let err = RewindError::not_found("snapshot cr_deadbeef");
        assert_eq!(err.to_string(), "not found: snapshot cr_deadbeef");
    }
}
