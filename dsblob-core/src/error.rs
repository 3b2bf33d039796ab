//! Error types for the blob engine

use serde::Serialize;

use crate::gc::GcRunRecord;
use crate::hash::BlobHash;
use crate::ingest::IntegrityReport;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(BlobHash),

    #[error("Checksum mismatch: expected {expected}, stored bytes hash to {actual}")]
    ChecksumMismatch { expected: BlobHash, actual: BlobHash },

    #[error("Corrupt blob frame for {hash}: {reason}")]
    Corrupt { hash: BlobHash, reason: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("{operation}: {} succeeded, {} failed ({})", .succeeded, .failures.len(), join_failures(.failures))]
    PartialFailure {
        operation: &'static str,
        succeeded: usize,
        failures: Vec<ItemFailure>,
    },

    #[error("Garbage collection aborted during {:?}: {cause}", .record.phase)]
    GcAborted {
        record: Box<GcRunRecord>,
        cause: Box<StorageError>,
    },

    #[error("Dataset version {} failed integrity check: {}", .0.version_id, .0.describe_failures())]
    Integrity(Box<IntegrityReport>),

    #[error("Unknown dataset version: {0}")]
    UnknownVersion(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the error means the bytes under a hash cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::ChecksumMismatch { .. } | StorageError::Corrupt { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A single failed item inside a batch operation
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub hash: BlobHash,
    pub error: String,
}

impl ItemFailure {
    pub fn new(hash: BlobHash, error: &StorageError) -> Self {
        Self {
            hash,
            error: error.to_string(),
        }
    }
}

fn join_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.hash, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_names_each_hash() {
        let a = BlobHash::from_data(b"a");
        let b = BlobHash::from_data(b"b");
        let err = StorageError::PartialFailure {
            operation: "tiering",
            succeeded: 3,
            failures: vec![
                ItemFailure::new(a, &StorageError::NotFound(a)),
                ItemFailure::new(b, &StorageError::BackendUnavailable("timeout".into())),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("tiering: 3 succeeded, 2 failed"));
        assert!(msg.contains(&a.to_hex()));
        assert!(msg.contains(&b.to_hex()));
    }

    #[test]
    fn test_corruption_classification() {
        let h = BlobHash::from_data(b"x");
        assert!(StorageError::ChecksumMismatch { expected: h, actual: h }.is_corruption());
        assert!(StorageError::Corrupt { hash: h, reason: "bad magic".into() }.is_corruption());
        assert!(!StorageError::NotFound(h).is_corruption());
        assert!(StorageError::NotFound(h).is_not_found());
    }
}
