//! Hot local tier in front of a cold remote tier
//!
//! New content always lands in the hot tier unless the cold tier already
//! holds it. Reads try hot first and fall back to cold. Blobs move between
//! the tiers only through [`TieringCapableStore::cool_down`] and
//! [`TieringCapableStore::warm_up`], and a move never removes the source copy
//! before the destination copy has been read back and verified.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BlobStore, LocalStore, RemoteStore, StoredBlob, Tier, TieringCapableStore};
use crate::codec::FrameInfo;
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;
use crate::locks::HashLocks;

/// Which tiers hold a live copy of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Residency {
    pub hot: bool,
    pub cold: bool,
}

impl Residency {
    /// The tier reads are served from
    pub fn primary(&self) -> Option<Tier> {
        if self.hot {
            Some(Tier::Hot)
        } else if self.cold {
            Some(Tier::Cold)
        } else {
            None
        }
    }
}

/// Two-tier store routing between a [`LocalStore`] and a [`RemoteStore`]
#[derive(Debug)]
pub struct HybridStore {
    hot: Arc<LocalStore>,
    cold: Arc<RemoteStore>,
    retain_cold_on_warm_up: bool,
    moves: HashLocks,
}

impl HybridStore {
    pub fn new(hot: Arc<LocalStore>, cold: Arc<RemoteStore>, retain_cold_on_warm_up: bool) -> Self {
        Self {
            hot,
            cold,
            retain_cold_on_warm_up,
            moves: HashLocks::new(),
        }
    }

    /// Get hot store reference
    pub fn hot(&self) -> &LocalStore {
        &self.hot
    }

    /// Get cold store reference
    pub fn cold(&self) -> &RemoteStore {
        &self.cold
    }

    /// Copy verified content into `to`, then read it back through `to`
    async fn copy_verified(
        hash: &BlobHash,
        data: Bytes,
        to: &dyn BlobStore,
    ) -> Result<StoredBlob> {
        let stored = to.put_blob(data).await?;
        if stored.hash != *hash {
            return Err(StorageError::ChecksumMismatch {
                expected: *hash,
                actual: stored.hash,
            });
        }
        if let Err(e) = to.get(hash).await {
            if e.is_corruption() && stored.newly_written {
                if let Err(cleanup) = to.delete(hash).await {
                    warn!("Failed to remove bad {} copy of {}: {}", to.backend_name(), hash, cleanup);
                }
            }
            return Err(e);
        }
        Ok(stored)
    }
}

#[async_trait]
impl BlobStore for HybridStore {
    async fn put_blob(&self, data: Bytes) -> Result<StoredBlob> {
        let hash = BlobHash::from_data(&data);
        let _guard = self.moves.lock(&hash).await;

        if self.hot.exists(&hash).await? {
            return self.hot.put_blob(data).await;
        }
        match self.cold.head(&hash).await {
            Ok(info) => {
                debug!("Blob {} already in cold tier", hash);
                return Ok(StoredBlob::existing(hash, data.len() as u64, info, Tier::Cold));
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                warn!("Cold tier lookup for {} failed, writing hot: {}", hash, e);
            }
        }
        self.hot.put_blob(data).await
    }

    async fn get(&self, hash: &BlobHash) -> Result<Bytes> {
        match self.hot.get(hash).await {
            Err(StorageError::NotFound(_)) => {}
            other => return other,
        }
        match self.cold.get(hash).await {
            // A concurrent warm-up may have just moved it
            Err(StorageError::NotFound(_)) => self.hot.get(hash).await,
            other => other,
        }
    }

    async fn head(&self, hash: &BlobHash) -> Result<FrameInfo> {
        match self.hot.head(hash).await {
            Err(StorageError::NotFound(_)) => self.cold.head(hash).await,
            other => other,
        }
    }

    async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        Ok(self.hot.exists(hash).await? || self.cold.exists(hash).await?)
    }

    async fn delete(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.moves.lock(hash).await;
        self.hot.delete(hash).await?;
        self.cold.delete(hash).await
    }

    async fn list(&self) -> Result<Vec<BlobHash>> {
        let mut all: BTreeSet<BlobHash> = self.hot.list().await?.into_iter().collect();
        all.extend(self.cold.list().await?);
        Ok(all.into_iter().collect())
    }

    async fn trash(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.moves.lock(hash).await;
        let mut trashed: Vec<&dyn BlobStore> = Vec::new();
        for tier in [&*self.hot as &dyn BlobStore, &*self.cold] {
            match tier.trash(hash).await {
                Ok(()) => trashed.push(tier),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    // All tiers or none
                    for done in trashed {
                        if let Err(undo) = done.restore(hash).await {
                            warn!(hash = %hash, tier = done.backend_name(), "Failed to undo trash: {}", undo);
                        }
                    }
                    return Err(e);
                }
            }
        }
        if trashed.is_empty() {
            Err(StorageError::NotFound(*hash))
        } else {
            Ok(())
        }
    }

    async fn restore(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.moves.lock(hash).await;
        let mut restored: Vec<&dyn BlobStore> = Vec::new();
        for tier in [&*self.hot as &dyn BlobStore, &*self.cold] {
            match tier.restore(hash).await {
                Ok(()) => restored.push(tier),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    for done in restored {
                        if let Err(undo) = done.trash(hash).await {
                            warn!(hash = %hash, tier = done.backend_name(), "Failed to undo restore: {}", undo);
                        }
                    }
                    return Err(e);
                }
            }
        }
        if restored.is_empty() {
            Err(StorageError::NotFound(*hash))
        } else {
            Ok(())
        }
    }

    async fn purge(&self, hash: &BlobHash) -> Result<u64> {
        Ok(self.hot.purge(hash).await? + self.cold.purge(hash).await?)
    }

    async fn list_trash(&self) -> Result<Vec<BlobHash>> {
        let mut all: BTreeSet<BlobHash> = self.hot.list_trash().await?.into_iter().collect();
        all.extend(self.cold.list_trash().await?);
        Ok(all.into_iter().collect())
    }

    async fn usage(&self) -> Result<u64> {
        Ok(self.hot.usage().await? + self.cold.usage().await?)
    }

    fn backend_name(&self) -> &'static str {
        "hybrid"
    }
}

#[async_trait]
impl TieringCapableStore for HybridStore {
    async fn cool_down(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.moves.lock(hash).await;

        let data = match self.hot.get(hash).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => {
                // Already cold is a no-op
                if self.cold.exists(hash).await? {
                    return Ok(());
                }
                return Err(StorageError::NotFound(*hash));
            }
            Err(e) => return Err(e),
        };

        Self::copy_verified(hash, data, &*self.cold).await?;
        self.hot.delete(hash).await?;
        debug!("Cooled down {}", hash);
        Ok(())
    }

    async fn warm_up(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.moves.lock(hash).await;

        if self.hot.exists(hash).await? {
            if !self.retain_cold_on_warm_up {
                self.cold.delete(hash).await?;
            }
            return Ok(());
        }

        let data = self.cold.get(hash).await?;
        Self::copy_verified(hash, data, &*self.hot).await?;
        if !self.retain_cold_on_warm_up {
            self.cold.delete(hash).await?;
        }
        debug!("Warmed up {}", hash);
        Ok(())
    }

    async fn locate(&self, hash: &BlobHash) -> Result<Residency> {
        Ok(Residency {
            hot: self.hot.exists(hash).await?,
            cold: self.cold.exists(hash).await?,
        })
    }
}
