//! Garbage collector
//!
//! A run walks `Idle -> Scanning -> Reconciling -> Trashing ->
//! (PermanentlyDeleting) -> Idle`:
//!
//! - **Scanning** lists every live hash in every tier.
//! - **Reconciling** subtracts the oracle's live references and drops blobs
//!   written or touched within the minimum-age window.
//! - **Trashing** moves each orphan into its tier's trash namespace. Bytes
//!   stay restorable until the trash is emptied.
//! - **PermanentlyDeleting** only happens on explicit request.
//!
//! The minimum-age window is what keeps GC from removing a blob a writer has
//! just stored but not yet referenced. Each orphan is re-checked under its
//! hash lock right before it is trashed, so a concurrent dedup write that
//! refreshes the blob always wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::error::{ItemFailure, Result, StorageError};
use crate::hash::BlobHash;
use crate::manager::BlobManager;
use crate::oracle::ReferenceOracle;

/// Phase of a collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcPhase {
    Idle,
    Scanning,
    Reconciling,
    Trashing,
    PermanentlyDeleting,
}

/// Why a run stopped without collecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GcSkipReason {
    /// Hot-tier usage is at or below the pressure high-water mark
    BelowHighWater { hot_bytes: u64, high_water: u64 },
    /// Another run holds the collector
    AlreadyRunning,
}

/// Summary of one collection run
#[derive(Debug, Clone, Serialize)]
pub struct GcRunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Furthest phase reached
    pub phase: GcPhase,
    pub dry_run: bool,
    pub scanned: usize,
    pub referenced: usize,
    /// Unreferenced blobs old enough to collect
    pub orphaned: usize,
    /// Unreferenced blobs still inside the minimum-age window
    pub too_young: usize,
    pub trashed: usize,
    pub bytes_trashed: u64,
    pub permanently_deleted: usize,
    pub bytes_freed: u64,
    pub orphans: Vec<BlobHash>,
    pub failures: Vec<ItemFailure>,
    pub skipped: Option<GcSkipReason>,
    pub cancelled: bool,
}

impl GcRunRecord {
    fn start(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            phase: GcPhase::Idle,
            dry_run,
            scanned: 0,
            referenced: 0,
            orphaned: 0,
            too_young: 0,
            trashed: 0,
            bytes_trashed: 0,
            permanently_deleted: 0,
            bytes_freed: 0,
            orphans: Vec::new(),
            failures: Vec::new(),
            skipped: None,
            cancelled: false,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Per-run overrides
#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    /// Report orphans without moving anything
    pub dry_run: bool,
    /// Override `gc.min_orphan_age_secs`
    pub min_orphan_age: Option<Duration>,
    /// Empty the trash after trashing
    pub purge_trash: bool,
    /// Only proceed past scanning when the hot tier is under pressure
    pub require_pressure: bool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Mark-and-trash collector over a [`BlobManager`]
pub struct GarbageCollector {
    manager: Arc<BlobManager>,
    oracle: Arc<dyn ReferenceOracle>,
    config: GcConfig,
    running: AtomicBool,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl GarbageCollector {
    pub fn new(manager: Arc<BlobManager>, oracle: Arc<dyn ReferenceOracle>, config: GcConfig) -> Self {
        Self {
            manager,
            oracle,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Whether hot-tier usage exceeds the pressure high-water mark
    pub fn under_pressure(&self) -> Result<bool> {
        Ok(self.manager.hot_bytes()? > self.config.pressure_high_water_bytes)
    }

    /// Unconditional collection pass
    pub async fn run(&self, cancel: &CancellationToken) -> Result<GcRunRecord> {
        self.run_with_options(GcOptions::default(), cancel).await
    }

    /// Collection pass that only proceeds past scanning under pressure
    pub async fn run_with_pressure(&self, cancel: &CancellationToken) -> Result<GcRunRecord> {
        let options = GcOptions {
            require_pressure: true,
            ..Default::default()
        };
        self.run_with_options(options, cancel).await
    }

    pub async fn run_with_options(
        &self,
        options: GcOptions,
        cancel: &CancellationToken,
    ) -> Result<GcRunRecord> {
        let mut record = GcRunRecord::start(options.dry_run);
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Garbage collection already running, skipping");
            record.skipped = Some(GcSkipReason::AlreadyRunning);
            return Ok(record.finish());
        }
        let _running = RunningGuard(&self.running);

        // Scanning
        record.phase = GcPhase::Scanning;
        self.manager.register_unindexed().await?;
        let stored = self.manager.scan().await?;
        record.scanned = stored.len();

        if options.require_pressure {
            let hot_bytes = self.manager.hot_bytes()?;
            let high_water = self.config.pressure_high_water_bytes;
            if hot_bytes <= high_water {
                debug!(hot_bytes, high_water, "Below high-water mark, nothing to collect");
                record.skipped = Some(GcSkipReason::BelowHighWater {
                    hot_bytes,
                    high_water,
                });
                return Ok(record.finish());
            }
        }
        if cancel.is_cancelled() {
            record.cancelled = true;
            return Ok(record.finish());
        }

        // Reconciling
        record.phase = GcPhase::Reconciling;
        let referenced: HashSet<BlobHash> = self.oracle.live_references().await?;
        let min_age = options
            .min_orphan_age
            .unwrap_or_else(|| self.config.min_orphan_age());
        let cutoff = chrono::Duration::from_std(min_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for hash in stored {
            if referenced.contains(&hash) {
                record.referenced += 1;
                continue;
            }
            match self.manager.record(&hash)? {
                Some(blob) if blob.touched_at <= cutoff => record.orphans.push(hash),
                Some(_) => record.too_young += 1,
                // Deleted since the scan
                None => {}
            }
        }
        record.orphaned = record.orphans.len();
        debug!(
            scanned = record.scanned,
            referenced = record.referenced,
            orphaned = record.orphaned,
            too_young = record.too_young,
            "Reconciled against reference oracle"
        );

        if options.dry_run {
            return Ok(record.finish());
        }

        // Trashing
        record.phase = GcPhase::Trashing;
        for hash in record.orphans.clone() {
            if cancel.is_cancelled() {
                record.cancelled = true;
                break;
            }
            match self.manager.trash_if_stale(&hash, cutoff).await {
                Ok(Some(bytes)) => {
                    record.trashed += 1;
                    record.bytes_trashed += bytes;
                }
                Ok(None) => {
                    debug!(hash = %hash, "Orphan refreshed by a writer, keeping");
                    record.too_young += 1;
                }
                Err(StorageError::NotFound(_)) => {
                    debug!(hash = %hash, "Orphan disappeared before trashing");
                }
                Err(e) => {
                    warn!(hash = %hash, "Failed to trash orphan: {}", e);
                    record.failures.push(ItemFailure::new(hash, &e));
                    return Err(StorageError::GcAborted {
                        record: Box::new(record.finish()),
                        cause: Box::new(e),
                    });
                }
            }
        }

        if options.purge_trash && !record.cancelled {
            record.phase = GcPhase::PermanentlyDeleting;
            self.purge_all(&mut record, cancel).await?;
        }

        info!(
            scanned = record.scanned,
            orphaned = record.orphaned,
            trashed = record.trashed,
            bytes_trashed = record.bytes_trashed,
            permanently_deleted = record.permanently_deleted,
            cancelled = record.cancelled,
            "Garbage collection finished"
        );
        Ok(record.finish())
    }

    /// Erase every trashed blob
    ///
    /// `permanent` must be true; emptying the trash cannot be undone.
    pub async fn empty_trash(&self, permanent: bool, cancel: &CancellationToken) -> Result<GcRunRecord> {
        if !permanent {
            return Err(StorageError::Usage(
                "emptying the trash is irreversible and requires permanent=true".to_string(),
            ));
        }

        let mut record = GcRunRecord::start(false);
        record.phase = GcPhase::PermanentlyDeleting;
        self.purge_all(&mut record, cancel).await?;

        info!(
            permanently_deleted = record.permanently_deleted,
            bytes_freed = record.bytes_freed,
            failed = record.failures.len(),
            "Trash emptied"
        );
        if !record.failures.is_empty() {
            return Err(StorageError::PartialFailure {
                operation: "empty_trash",
                succeeded: record.permanently_deleted,
                failures: record.failures,
            });
        }
        Ok(record.finish())
    }

    async fn purge_all(&self, record: &mut GcRunRecord, cancel: &CancellationToken) -> Result<()> {
        for hash in self.manager.trashed_hashes().await? {
            if cancel.is_cancelled() {
                record.cancelled = true;
                break;
            }
            match self.manager.purge_from_trash(&hash).await {
                Ok(freed) => {
                    record.permanently_deleted += 1;
                    record.bytes_freed += freed;
                }
                Err(e) => {
                    warn!(hash = %hash, "Failed to purge trashed blob: {}", e);
                    record.failures.push(ItemFailure::new(hash, &e));
                }
            }
        }
        Ok(())
    }
}
