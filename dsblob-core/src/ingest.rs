//! Ingestion and dataset integrity verification
//!
//! Verification reads every blob a dataset version needs through the same
//! path consumers use, so a blob that verifies is a blob readers can get.

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ItemFailure, Result, StorageError};
use crate::hash::BlobHash;
use crate::manager::BlobManager;
use crate::oracle::ReferenceOracle;

/// Blobs checked concurrently during verification
const VERIFY_CONCURRENCY: usize = 16;

/// Result of verifying one dataset version
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub version_id: String,
    /// Blobs the version references
    pub total: usize,
    /// Blobs checked before finishing or being cancelled
    pub checked: usize,
    /// Absent from every tier
    pub missing: Vec<BlobHash>,
    /// Bytes present but failing their hash or frame checks
    pub corrupted: Vec<ItemFailure>,
    /// Could not be read for another reason (backend down, missing key)
    pub unavailable: Vec<ItemFailure>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty() && self.unavailable.is_empty()
    }

    /// Every offending hash with its problem
    pub fn bad_hashes(&self) -> Vec<BlobHash> {
        let mut bad: Vec<BlobHash> = self.missing.clone();
        bad.extend(self.corrupted.iter().map(|f| f.hash));
        bad.extend(self.unavailable.iter().map(|f| f.hash));
        bad
    }

    pub fn describe_failures(&self) -> String {
        let mut parts = Vec::new();
        for hash in &self.missing {
            parts.push(format!("{}: missing", hash));
        }
        for f in &self.corrupted {
            parts.push(format!("{}: corrupted ({})", f.hash, f.error));
        }
        for f in &self.unavailable {
            parts.push(format!("{}: unavailable ({})", f.hash, f.error));
        }
        parts.join("; ")
    }
}

enum Check {
    Ok,
    Missing,
    Corrupted(StorageError),
    Unavailable(StorageError),
}

/// Writes dataset content and verifies dataset versions
#[derive(Clone)]
pub struct Ingestion {
    manager: Arc<BlobManager>,
    oracle: Arc<dyn ReferenceOracle>,
}

impl std::fmt::Debug for Ingestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestion").finish_non_exhaustive()
    }
}

impl Ingestion {
    pub fn new(manager: Arc<BlobManager>, oracle: Arc<dyn ReferenceOracle>) -> Self {
        Self { manager, oracle }
    }

    /// Store content for `version_id` and return the hash to reference
    ///
    /// Recording the reference is the caller's job; until it lands, the
    /// minimum-age window keeps the blob safe from collection.
    pub async fn ingest(&self, version_id: &str, data: Bytes) -> Result<BlobHash> {
        let size = data.len();
        let hash = self.manager.put(data).await?;
        debug!(version = version_id, hash = %hash, size, "Ingested blob");
        Ok(hash)
    }

    async fn check(&self, hash: BlobHash) -> Check {
        match self.manager.exists(&hash).await {
            Ok(false) => return Check::Missing,
            Ok(true) => {}
            Err(e) => return Check::Unavailable(e),
        }
        match self.manager.read(&hash).await {
            Ok(data) if hash.matches(&data) => Check::Ok,
            Ok(data) => Check::Corrupted(StorageError::ChecksumMismatch {
                expected: hash,
                actual: BlobHash::from_data(&data),
            }),
            Err(StorageError::NotFound(_)) => Check::Missing,
            Err(e) if e.is_corruption() => Check::Corrupted(e),
            Err(e) => Check::Unavailable(e),
        }
    }

    /// Confirm every blob `version_id` references exists, reads back and
    /// matches its hash
    ///
    /// Fails with [`StorageError::Integrity`] naming each bad hash,
    /// [`StorageError::UnknownVersion`] if the oracle does not know the
    /// version, or [`StorageError::Cancelled`].
    pub async fn verify_dataset_integrity(
        &self,
        version_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IntegrityReport> {
        let Some(references) = self.oracle.version_references(version_id).await? else {
            return Err(StorageError::UnknownVersion(version_id.to_string()));
        };
        let mut hashes: Vec<BlobHash> = references.into_iter().collect();
        hashes.sort();

        let mut report = IntegrityReport {
            version_id: version_id.to_string(),
            total: hashes.len(),
            ..Default::default()
        };

        for chunk in hashes.chunks(VERIFY_CONCURRENCY) {
            if cancel.is_cancelled() {
                info!(
                    version = version_id,
                    checked = report.checked,
                    total = report.total,
                    "Verification cancelled"
                );
                return Err(StorageError::Cancelled);
            }
            let results = join_all(chunk.iter().map(|hash| self.check(*hash))).await;
            for (hash, result) in chunk.iter().zip(results) {
                report.checked += 1;
                match result {
                    Check::Ok => {}
                    Check::Missing => {
                        warn!(version = version_id, hash = %hash, "Blob missing");
                        report.missing.push(*hash);
                    }
                    Check::Corrupted(e) => {
                        warn!(version = version_id, hash = %hash, "Blob corrupted: {}", e);
                        report.corrupted.push(ItemFailure::new(*hash, &e));
                    }
                    Check::Unavailable(e) => {
                        warn!(version = version_id, hash = %hash, "Blob unavailable: {}", e);
                        report.unavailable.push(ItemFailure::new(*hash, &e));
                    }
                }
            }
        }

        if !report.is_intact() {
            return Err(StorageError::Integrity(Box::new(report)));
        }
        info!(version = version_id, blobs = report.total, "Dataset version verified");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::oracle::MemoryReferenceOracle;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<BlobManager>, Arc<MemoryReferenceOracle>, Ingestion) {
        let manager = Arc::new(
            BlobManager::open(&EngineConfig::local(dir.path().join("blobs")))
                .await
                .unwrap(),
        );
        let oracle = Arc::new(MemoryReferenceOracle::new());
        let ingestion = Ingestion::new(manager.clone(), oracle.clone());
        (manager, oracle, ingestion)
    }

    #[tokio::test]
    async fn test_intact_version_verifies() {
        let dir = TempDir::new().unwrap();
        let (_, oracle, ingestion) = setup(&dir).await;
        let mut hashes = Vec::new();
        for i in 0..40 {
            let data = Bytes::from(format!("chunk {}", i));
            hashes.push(ingestion.ingest("v1", data).await.unwrap());
        }
        oracle.set_version("v1", hashes).await;

        let report = ingestion
            .verify_dataset_integrity("v1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_intact());
        assert_eq!(report.checked, 40);
    }

    #[tokio::test]
    async fn test_missing_and_corrupted_blobs_are_named() {
        let dir = TempDir::new().unwrap();
        let (manager, oracle, ingestion) = setup(&dir).await;
        let good = ingestion.ingest("v1", Bytes::from_static(b"good")).await.unwrap();
        let gone = ingestion.ingest("v1", Bytes::from_static(b"gone")).await.unwrap();
        let bad = ingestion.ingest("v1", Bytes::from_static(b"bad")).await.unwrap();
        oracle.set_version("v1", [good, gone, bad]).await;

        manager.delete(&gone).await.unwrap();
        let path = manager.backend().hot().object_path(&bad);
        let mut frame = std::fs::read(&path).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        std::fs::write(&path, frame).unwrap();

        let err = ingestion
            .verify_dataset_integrity("v1", &CancellationToken::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        match err {
            StorageError::Integrity(report) => {
                assert_eq!(report.missing, vec![gone]);
                assert_eq!(report.corrupted.len(), 1);
                assert_eq!(report.corrupted[0].hash, bad);
                assert!(report.unavailable.is_empty());
                assert!(!report.bad_hashes().contains(&good));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(message.contains(&gone.to_hex()));
        assert!(message.contains(&bad.to_hex()));
        assert!(!message.contains(&good.to_hex()));
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let dir = TempDir::new().unwrap();
        let (_, _, ingestion) = setup(&dir).await;
        let err = ingestion
            .verify_dataset_integrity("nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownVersion(v) if v == "nope"));
    }

    #[tokio::test]
    async fn test_cancelled_verification() {
        let dir = TempDir::new().unwrap();
        let (_, oracle, ingestion) = setup(&dir).await;
        let hash = ingestion.ingest("v1", Bytes::from_static(b"x")).await.unwrap();
        oracle.set_version("v1", [hash]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ingestion
            .verify_dataset_integrity("v1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_verification_does_not_count_as_access() {
        let dir = TempDir::new().unwrap();
        let (manager, oracle, ingestion) = setup(&dir).await;
        let hash = ingestion.ingest("v1", Bytes::from_static(b"quiet")).await.unwrap();
        oracle.set_version("v1", [hash]).await;

        ingestion
            .verify_dataset_integrity("v1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manager.record(&hash).unwrap().unwrap().access_count, 0);
    }
}
