//! Blob manager
//!
//! The single entry point for writers, readers and the maintenance
//! machinery. It pairs the selected [`StoreBackend`] with the [`BlobIndex`]
//! and owns the per-hash lock table that serializes writers against the
//! garbage collector and tier moves.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::BlobCodec;
use crate::config::{EngineConfig, StorageMode, TieringPolicy};
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;
use crate::index::{BlobIndex, BlobRecord, TrashEntry};
use crate::locks::HashLocks;
use crate::store::{BlobStore, HybridStore, StoreBackend, StoredBlob, Tier, TieringCapableStore};
use crate::tiering::{TieringPolicyEngine, TieringReport};

/// Storage statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_blobs: u64,
    /// Plain bytes
    pub total_size: u64,
    /// Stored frame bytes; zero when compression is disabled
    pub total_size_compressed: u64,
    pub oldest_blob: Option<DateTime<Utc>>,
    pub newest_blob: Option<DateTime<Utc>>,
    pub backend: &'static str,
    pub hot_bytes: u64,
    pub cold_bytes: u64,
    pub trashed_blobs: u64,
    /// Whether new frames are sealed
    pub encrypted: bool,
}

impl Stats {
    /// Stored-to-plain ratio, when compression is on and anything is stored
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.total_size_compressed == 0 || self.total_size == 0 {
            return None;
        }
        Some(self.total_size_compressed as f64 / self.total_size as f64)
    }
}

/// What [`BlobManager::rebuild_index`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    /// Live blobs found in a store but missing from the index
    pub registered: usize,
    /// Index records whose bytes no store holds
    pub dropped: usize,
    pub trash_registered: usize,
    pub trash_dropped: usize,
    /// Stored bytes the stores hold once reconciled
    pub stored_bytes: u64,
}

/// Coordinates the store, the index and per-hash locking
pub struct BlobManager {
    backend: StoreBackend,
    index: Arc<BlobIndex>,
    codec: Arc<BlobCodec>,
    locks: HashLocks,
    policy: TieringPolicy,
}

impl std::fmt::Debug for BlobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobManager")
            .field("mode", &self.backend.mode())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl BlobManager {
    pub fn new(
        backend: StoreBackend,
        index: Arc<BlobIndex>,
        codec: Arc<BlobCodec>,
        policy: TieringPolicy,
    ) -> Self {
        Self {
            backend,
            index,
            codec,
            locks: HashLocks::new(),
            policy,
        }
    }

    /// Open stores and index from configuration and register any blob the
    /// index does not know yet
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(BlobCodec::new(&config.compression, &config.encryption)?);
        let backend = StoreBackend::open(config, codec.clone()).await?;
        let index = Arc::new(BlobIndex::open(&config.index_path())?);
        let manager = Self::new(backend, index, codec, config.tiering.clone());

        let registered = manager.register_unindexed().await?;
        if registered > 0 {
            info!("Registered {} unindexed blobs", registered);
        }
        Ok(manager)
    }

    pub fn mode(&self) -> StorageMode {
        self.backend.mode()
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn policy(&self) -> &TieringPolicy {
        &self.policy
    }

    fn store(&self) -> &dyn BlobStore {
        self.backend.store()
    }

    /// The hybrid store, or a configuration error outside hybrid mode
    pub fn tiering_store(&self) -> Result<&Arc<HybridStore>> {
        self.backend.hybrid().ok_or_else(|| {
            StorageError::Configuration(format!(
                "tiering requires hybrid mode (running in {} mode)",
                self.backend.mode().as_str()
            ))
        })
    }

    /// Store content and return its address
    ///
    /// Content already stored is not written again; content sitting in the
    /// trash is restored instead of re-stored.
    pub async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_data(&data);
        let _guard = self.locks.lock(&hash).await;
        let now = Utc::now();

        if self.index.contains(&hash)? {
            if self.store().exists(&hash).await? {
                self.index.touch(&hash, now)?;
                debug!(hash = %hash, "Deduplicated write");
                return Ok(hash);
            }
            warn!(hash = %hash, "Indexed blob missing from store, rewriting");
        }

        if self.index.trash_entry(&hash)?.is_some() {
            match self.store().restore(&hash).await {
                Ok(()) => {
                    self.index.restore_from_trash(&hash, now)?;
                    info!(hash = %hash, "Write resurrected trashed blob");
                    return Ok(hash);
                }
                Err(StorageError::NotFound(_)) => {
                    self.index.remove_trash(&hash)?;
                }
                Err(e) => return Err(e),
            }
        }

        let stored = self.store().put_blob(data).await?;
        self.index
            .insert(&BlobRecord::new(&stored, self.codec.key_id(), now))?;
        debug!(
            hash = %hash,
            size = stored.size,
            stored_size = stored.stored_size,
            tier = %stored.tier,
            "Stored blob"
        );
        Ok(hash)
    }

    /// Read verified content and count the access
    pub async fn get(&self, hash: &BlobHash) -> Result<Bytes> {
        let data = self.read(hash).await?;
        if let Err(e) = self.index.record_access(hash, Utc::now()) {
            warn!(hash = %hash, "Failed to record access: {}", e);
        }
        Ok(data)
    }

    /// Read verified content without touching access statistics
    pub(crate) async fn read(&self, hash: &BlobHash) -> Result<Bytes> {
        self.store().get(hash).await
    }

    pub async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        self.store().exists(hash).await
    }

    /// Permanently delete a live blob from every tier
    pub async fn delete(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        let indexed = self.index.contains(hash)?;
        if !indexed && !self.store().exists(hash).await? {
            return Err(StorageError::NotFound(*hash));
        }
        self.store().delete(hash).await?;
        self.index.remove(hash)?;
        debug!(hash = %hash, "Deleted blob");
        Ok(())
    }

    /// Index record for a live blob
    pub fn record(&self, hash: &BlobHash) -> Result<Option<BlobRecord>> {
        self.index.get(hash)
    }

    /// All live index records
    pub fn records(&self) -> Result<Vec<BlobRecord>> {
        self.index.list()
    }

    pub fn stats(&self) -> Result<Stats> {
        let summary = self.index.summary()?;
        Ok(Stats {
            total_blobs: summary.total_blobs,
            total_size: summary.total_size,
            total_size_compressed: if self.codec.compression_enabled() {
                summary.total_stored_size
            } else {
                0
            },
            oldest_blob: summary.oldest_blob,
            newest_blob: summary.newest_blob,
            backend: self.store().backend_name(),
            hot_bytes: summary.hot_bytes,
            cold_bytes: summary.cold_bytes,
            trashed_blobs: summary.trashed_blobs,
            encrypted: self.codec.encryption_enabled(),
        })
    }

    /// Stored bytes the index attributes to the hot tier
    pub fn hot_bytes(&self) -> Result<u64> {
        self.index.tier_bytes(Tier::Hot)
    }

    /// Move a hot blob to the cold tier
    pub async fn cool_down(&self, hash: &BlobHash) -> Result<()> {
        let hybrid = self.tiering_store()?;
        let _guard = self.locks.lock(hash).await;
        hybrid.cool_down(hash).await?;
        self.set_tier(hash, Tier::Cold).await?;
        info!(hash = %hash, "Cooled down blob");
        Ok(())
    }

    /// Bring a cold blob into the hot tier
    pub async fn warm_up(&self, hash: &BlobHash) -> Result<()> {
        let hybrid = self.tiering_store()?;
        let _guard = self.locks.lock(hash).await;
        hybrid.warm_up(hash).await?;
        self.set_tier(hash, Tier::Hot).await?;
        info!(hash = %hash, "Warmed up blob");
        Ok(())
    }

    async fn set_tier(&self, hash: &BlobHash, tier: Tier) -> Result<()> {
        if self.index.set_tier(hash, tier)? {
            return Ok(());
        }
        // Bytes moved but the index never knew them
        self.register(hash, tier).await
    }

    /// Evaluate the tiering policy and execute the resulting moves
    ///
    /// Moves are best-effort; if any failed the result is
    /// [`StorageError::PartialFailure`] naming each hash.
    pub async fn apply_tiering_policy(&self, cancel: &CancellationToken) -> Result<TieringReport> {
        self.tiering_store()?;
        let engine = TieringPolicyEngine::new(self.policy.clone());
        engine.apply(self, cancel).await?.ensure_complete()
    }

    /// Every hash held live by the store, in any tier
    pub async fn scan(&self) -> Result<Vec<BlobHash>> {
        self.store().list().await
    }

    async fn register(&self, hash: &BlobHash, tier: Tier) -> Result<()> {
        let info = self.store().head(hash).await?;
        let size = match self.read(hash).await {
            Ok(data) => data.len() as u64,
            Err(e) => {
                warn!(hash = %hash, "Registering unreadable blob: {}", e);
                0
            }
        };
        let stored = StoredBlob::existing(*hash, size, info, tier);
        let key_id = if info.encrypted { self.codec.key_id() } else { None };
        self.index.insert(&BlobRecord::new(&stored, key_id, Utc::now()))
    }

    async fn tier_of(&self, hash: &BlobHash) -> Result<Tier> {
        match self.backend.hybrid() {
            Some(hybrid) => Ok(hybrid.locate(hash).await?.primary().unwrap_or(Tier::Hot)),
            None => Ok(Tier::Hot),
        }
    }

    /// Add index records for stored blobs the index does not know
    ///
    /// Newly registered blobs count as written now, so they only become
    /// orphan candidates after the minimum-age window.
    pub async fn register_unindexed(&self) -> Result<usize> {
        let mut registered = 0;
        for hash in self.scan().await? {
            if self.index.contains(&hash)? {
                continue;
            }
            let _guard = self.locks.lock(&hash).await;
            if self.index.contains(&hash)? {
                continue;
            }
            let tier = self.tier_of(&hash).await?;
            match self.register(&hash, tier).await {
                Ok(()) => registered += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(registered)
    }

    /// Reconcile the index with what the stores actually hold
    pub async fn rebuild_index(&self) -> Result<ReindexReport> {
        let mut report = ReindexReport {
            registered: self.register_unindexed().await?,
            ..Default::default()
        };

        let live: HashSet<BlobHash> = self.scan().await?.into_iter().collect();
        for record in self.index.list()? {
            if live.contains(&record.hash) {
                continue;
            }
            let _guard = self.locks.lock(&record.hash).await;
            if !self.store().exists(&record.hash).await? && self.index.remove(&record.hash)? {
                warn!(hash = %record.hash, "Dropped index record without bytes");
                report.dropped += 1;
            }
        }

        let trashed: HashSet<BlobHash> = self.store().list_trash().await?.into_iter().collect();
        let indexed_trash: HashSet<BlobHash> = self
            .index
            .list_trash()?
            .into_iter()
            .map(|entry| entry.record.hash)
            .collect();
        for hash in trashed.difference(&indexed_trash) {
            let now = Utc::now();
            let record = BlobRecord {
                hash: *hash,
                size: 0,
                stored_size: 0,
                compression: crate::codec::Compression::None,
                encrypted: false,
                key_id: None,
                tier: Tier::Hot,
                created_at: now,
                touched_at: now,
                last_accessed_at: None,
                access_count: 0,
            };
            self.index.insert_trash(&TrashEntry {
                record,
                deleted_at: now,
            })?;
            report.trash_registered += 1;
        }
        for hash in indexed_trash.difference(&trashed) {
            if self.index.remove_trash(hash)? {
                report.trash_dropped += 1;
            }
        }

        report.stored_bytes = self.store().usage().await?;

        info!(
            registered = report.registered,
            dropped = report.dropped,
            trash_registered = report.trash_registered,
            trash_dropped = report.trash_dropped,
            stored_bytes = report.stored_bytes,
            "Index rebuilt"
        );
        Ok(report)
    }

    /// Trash `hash` unless it was written or touched after `cutoff`
    ///
    /// Returns the stored bytes moved to trash, or `None` when the blob
    /// turned out to be too young once the lock was held.
    pub async fn trash_if_stale(
        &self,
        hash: &BlobHash,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let _guard = self.locks.lock(hash).await;
        let record = self.index.get(hash)?.ok_or(StorageError::NotFound(*hash))?;
        if record.touched_at > cutoff {
            return Ok(None);
        }

        self.store().trash(hash).await?;
        if let Err(e) = self.index.move_to_trash(hash, Utc::now()) {
            // Keep bytes and index in agreement
            if let Err(undo) = self.store().restore(hash).await {
                warn!(hash = %hash, "Failed to undo trash after index error: {}", undo);
            }
            return Err(e);
        }
        debug!(hash = %hash, "Trashed blob");
        Ok(Some(record.stored_size))
    }

    /// Bring a trashed blob back to its original tier
    pub async fn restore_from_trash(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        let entry = self.index.trash_entry(hash)?;
        self.store().restore(hash).await?;
        match entry {
            Some(_) => {
                self.index.restore_from_trash(hash, Utc::now())?;
            }
            None => {
                let tier = self.tier_of(hash).await?;
                self.register(hash, tier).await?;
            }
        }
        info!(hash = %hash, "Restored blob from trash");
        Ok(())
    }

    /// Erase a trashed blob, returning the bytes freed
    pub async fn purge_from_trash(&self, hash: &BlobHash) -> Result<u64> {
        let _guard = self.locks.lock(hash).await;
        let freed = self.store().purge(hash).await?;
        self.index.remove_trash(hash)?;
        debug!(hash = %hash, freed, "Purged blob");
        Ok(freed)
    }

    /// Trash index entries, earliest first
    pub fn list_trash(&self) -> Result<Vec<TrashEntry>> {
        self.index.list_trash()
    }

    /// Every trashed hash known to the index or present in a trash namespace
    pub async fn trashed_hashes(&self) -> Result<Vec<BlobHash>> {
        let mut all: HashSet<BlobHash> = self.store().list_trash().await?.into_iter().collect();
        all.extend(self.index.list_trash()?.into_iter().map(|e| e.record.hash));
        let mut all: Vec<_> = all.into_iter().collect();
        all.sort();
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use tempfile::TempDir;

    async fn local_manager(dir: &TempDir) -> BlobManager {
        BlobManager::open(&EngineConfig::local(dir.path().join("blobs")))
            .await
            .unwrap()
    }

    async fn hybrid_manager(dir: &TempDir) -> BlobManager {
        BlobManager::open(&EngineConfig::hybrid(
            dir.path().join("blobs"),
            RemoteConfig::Local {
                path: dir.path().join("cold"),
            },
        ))
        .await
        .unwrap()
    }

    /// Hybrid manager whose filesystem cold tier fails every call until
    /// the returned blocker file is removed
    async fn broken_cold_manager(dir: &TempDir) -> (BlobManager, std::path::PathBuf) {
        let mut config = EngineConfig::hybrid(
            dir.path().join("blobs"),
            RemoteConfig::Local {
                path: dir.path().join("cold"),
            },
        );
        config.retry.max_attempts = 1;
        let manager = BlobManager::open(&config).await.unwrap();
        let blocker = dir.path().join("cold").join("data");
        std::fs::write(&blocker, b"not a directory").unwrap();
        (manager, blocker)
    }

    #[tokio::test]
    async fn test_put_get_stats() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;

        let data = Bytes::from(vec![b'x'; 10_000]);
        let hash = manager.put(data.clone()).await.unwrap();
        assert_eq!(manager.get(&hash).await.unwrap(), data);

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_blobs, 1);
        assert_eq!(stats.total_size, 10_000);
        assert!(stats.total_size_compressed > 0);
        assert!(stats.total_size_compressed < 10_000);
        assert!(stats.compression_ratio().unwrap() < 1.0);
        assert_eq!(stats.backend, "local");
        assert_eq!(stats.hot_bytes, stats.total_size_compressed);
        assert!(!stats.encrypted);

        let record = manager.record(&hash).unwrap().unwrap();
        assert_eq!(record.access_count, 1);
    }

    #[tokio::test]
    async fn test_stats_report_encryption() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::local(dir.path().join("blobs"));
        config.encryption.enabled = true;
        config.encryption.key_id = "k1".to_string();
        config.encryption.key_hex = Some("11".repeat(32));
        config.encryption.key_env = None;
        let manager = BlobManager::open(&config).await.unwrap();

        let hash = manager.put(Bytes::from_static(b"sealed")).await.unwrap();
        assert!(manager.stats().unwrap().encrypted);
        assert_eq!(manager.record(&hash).unwrap().unwrap().key_id.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_stats_without_compression() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::local(dir.path().join("blobs"));
        config.compression.enabled = false;
        let manager = BlobManager::open(&config).await.unwrap();

        manager.put(Bytes::from_static(b"plain")).await.unwrap();
        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_size_compressed, 0);
        assert_eq!(stats.compression_ratio(), None);
    }

    #[tokio::test]
    async fn test_concurrent_identical_puts() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(local_manager(&dir).await);
        let data = Bytes::from_static(b"dataset-chunk-1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let data = data.clone();
            handles.push(tokio::spawn(async move { manager.put(data).await }));
        }
        let mut hashes = HashSet::new();
        for h in handles {
            hashes.insert(h.await.unwrap().unwrap());
        }
        assert_eq!(hashes.len(), 1);
        assert_eq!(manager.stats().unwrap().total_blobs, 1);
        assert_eq!(manager.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let hash = manager.put(Bytes::from_static(b"gone soon")).await.unwrap();

        manager.delete(&hash).await.unwrap();
        assert!(!manager.exists(&hash).await.unwrap());
        assert!(manager.get(&hash).await.unwrap_err().is_not_found());
        assert!(manager.delete(&hash).await.unwrap_err().is_not_found());
        assert_eq!(manager.stats().unwrap().total_blobs, 0);
    }

    #[tokio::test]
    async fn test_tiering_requires_hybrid_mode() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let hash = manager.put(Bytes::from_static(b"local only")).await.unwrap();

        for err in [
            manager.cool_down(&hash).await.unwrap_err(),
            manager.warm_up(&hash).await.unwrap_err(),
            manager
                .apply_tiering_policy(&CancellationToken::new())
                .await
                .unwrap_err(),
        ] {
            assert!(matches!(err, StorageError::Configuration(_)));
        }
    }

    #[tokio::test]
    async fn test_cool_down_warm_up_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = hybrid_manager(&dir).await;
        let data = Bytes::from(vec![b'r'; 20_000]);
        let hash = manager.put(data.clone()).await.unwrap();

        manager.cool_down(&hash).await.unwrap();
        assert_eq!(manager.record(&hash).unwrap().unwrap().tier, Tier::Cold);
        let stats = manager.stats().unwrap();
        assert_eq!(stats.hot_bytes, 0);
        assert!(stats.cold_bytes > 0);
        assert_eq!(manager.get(&hash).await.unwrap(), data);

        manager.warm_up(&hash).await.unwrap();
        assert_eq!(manager.record(&hash).unwrap().unwrap().tier, Tier::Hot);
        assert_eq!(manager.get(&hash).await.unwrap(), data);
        assert_eq!(manager.stats().unwrap().total_blobs, 1);
    }

    #[tokio::test]
    async fn test_trash_restore_and_resurrect() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let data = Bytes::from_static(b"trash me");
        let hash = manager.put(data.clone()).await.unwrap();

        let moved = manager.trash_if_stale(&hash, Utc::now()).await.unwrap();
        assert!(moved.unwrap() > 0);
        assert!(manager.get(&hash).await.unwrap_err().is_not_found());
        assert_eq!(manager.list_trash().unwrap().len(), 1);
        assert_eq!(manager.stats().unwrap().trashed_blobs, 1);

        manager.restore_from_trash(&hash).await.unwrap();
        assert_eq!(manager.get(&hash).await.unwrap(), data);
        assert!(manager.list_trash().unwrap().is_empty());

        manager.trash_if_stale(&hash, Utc::now()).await.unwrap();
        // Writing the same content again brings it back
        assert_eq!(manager.put(data.clone()).await.unwrap(), hash);
        assert_eq!(manager.get(&hash).await.unwrap(), data);
        assert_eq!(manager.stats().unwrap().trashed_blobs, 0);
    }

    #[tokio::test]
    async fn test_trash_skips_recently_touched() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let hash = manager.put(Bytes::from_static(b"young")).await.unwrap();

        assert_eq!(manager.trash_if_stale(&hash, cutoff).await.unwrap(), None);
        assert!(manager.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_is_permanent() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let hash = manager.put(Bytes::from_static(b"purge me")).await.unwrap();
        manager.trash_if_stale(&hash, Utc::now()).await.unwrap();

        assert!(manager.purge_from_trash(&hash).await.unwrap() > 0);
        assert!(manager.trashed_hashes().await.unwrap().is_empty());
        assert!(manager.restore_from_trash(&hash).await.unwrap_err().is_not_found());
        assert!(manager.get(&hash).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_registers_unindexed_blobs() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let manager = local_manager(&dir).await;
            manager.put(Bytes::from_static(b"survives")).await.unwrap()
        };
        std::fs::remove_file(dir.path().join("blobs").join("index.sqlite")).unwrap();
        let _ = std::fs::remove_file(dir.path().join("blobs").join("index.sqlite-wal"));
        let _ = std::fs::remove_file(dir.path().join("blobs").join("index.sqlite-shm"));

        let manager = local_manager(&dir).await;
        let record = manager.record(&hash).unwrap().unwrap();
        assert_eq!(record.size, b"survives".len() as u64);
        assert_eq!(manager.stats().unwrap().total_blobs, 1);
    }

    #[tokio::test]
    async fn test_rebuild_index_drops_lost_blobs() {
        let dir = TempDir::new().unwrap();
        let manager = local_manager(&dir).await;
        let kept = manager.put(Bytes::from_static(b"kept")).await.unwrap();
        let lost = manager.put(Bytes::from_static(b"lost")).await.unwrap();
        std::fs::remove_file(manager.backend().hot().object_path(&lost)).unwrap();

        let report = manager.rebuild_index().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.registered, 0);
        let kept_record = manager.record(&kept).unwrap().unwrap();
        assert_eq!(report.stored_bytes, kept_record.stored_size);
        assert!(manager.record(&lost).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hot_tier_works_while_cold_is_down() {
        let dir = TempDir::new().unwrap();
        let (manager, _blocker) = broken_cold_manager(&dir).await;
        let data = Bytes::from_static(b"written during a cold outage");

        let hash = manager.put(data.clone()).await.unwrap();
        assert_eq!(manager.get(&hash).await.unwrap(), data);
        assert!(manager.exists(&hash).await.unwrap());
        assert_eq!(manager.record(&hash).unwrap().unwrap().tier, Tier::Hot);

        // Moves fail without touching the hot copy
        let err = manager.cool_down(&hash).await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
        assert!(manager.backend().hot().exists(&hash).await.unwrap());
        assert_eq!(manager.record(&hash).unwrap().unwrap().tier, Tier::Hot);
        assert_eq!(manager.get(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_trash_keeps_blob_live() {
        let dir = TempDir::new().unwrap();
        let (manager, blocker) = broken_cold_manager(&dir).await;
        let data = Bytes::from_static(b"orphan during a cold outage");
        let hash = manager.put(data.clone()).await.unwrap();

        let err = manager.trash_if_stale(&hash, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
        assert!(manager.record(&hash).unwrap().is_some());
        assert!(manager.backend().hot().exists(&hash).await.unwrap());
        assert!(manager.backend().hot().list_trash().await.unwrap().is_empty());
        assert_eq!(manager.get(&hash).await.unwrap(), data);

        // Once the cold tier is back nothing is waiting in the trash
        std::fs::remove_file(&blocker).unwrap();
        assert!(manager.trashed_hashes().await.unwrap().is_empty());
        assert_eq!(manager.stats().unwrap().total_blobs, 1);
        assert_eq!(manager.get(&hash).await.unwrap(), data);

        // And a retry trashes every tier
        assert!(manager.trash_if_stale(&hash, Utc::now()).await.unwrap().is_some());
        assert_eq!(manager.trashed_hashes().await.unwrap(), vec![hash]);
        assert!(manager.record(&hash).unwrap().is_none());
    }
}
