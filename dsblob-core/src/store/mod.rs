//! Storage abstraction layer
//!
//! Every tier is a content-addressed [`BlobStore`]. The engine runs either on
//! a [`LocalStore`] alone or on a [`HybridStore`] that pairs the local hot tier
//! with a [`RemoteStore`] cold tier. The choice is made once, from
//! configuration, and carried as a [`StoreBackend`].

mod hybrid;
mod local;
mod remote;

pub use hybrid::{HybridStore, Residency};
pub use local::LocalStore;
pub use remote::RemoteStore;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::codec::{BlobCodec, Compression, FrameInfo};
use crate::config::{EngineConfig, StorageMode};
use crate::error::Result;
use crate::hash::BlobHash;

/// Storage tier a blob lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Cold => "cold",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cold" => Tier::Cold,
            _ => Tier::Hot,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a content-addressed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlob {
    pub hash: BlobHash,
    /// Plain size
    pub size: u64,
    /// Frame size on the backend
    pub stored_size: u64,
    pub compression: Compression,
    pub encrypted: bool,
    /// Tier that holds the bytes
    pub tier: Tier,
    /// False when the content was already present and nothing was written
    pub newly_written: bool,
}

impl StoredBlob {
    pub(crate) fn existing(hash: BlobHash, size: u64, info: FrameInfo, tier: Tier) -> Self {
        Self {
            hash,
            size,
            stored_size: info.stored_size,
            compression: info.compression,
            encrypted: info.encrypted,
            tier,
            newly_written: false,
        }
    }
}

/// Content-addressed blob store interface
///
/// All storage tiers must implement this trait. Reads always return bytes
/// that hash to the requested address, or an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store content, returning what was written (or found)
    async fn put_blob(&self, data: Bytes) -> Result<StoredBlob>;

    /// Store content and return its address
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        Ok(self.put_blob(data).await?.hash)
    }

    /// Get verified plain bytes
    async fn get(&self, hash: &BlobHash) -> Result<Bytes>;

    /// Frame facts without decoding the payload
    async fn head(&self, hash: &BlobHash) -> Result<FrameInfo>;

    /// Check if a live (non-trashed) copy exists
    async fn exists(&self, hash: &BlobHash) -> Result<bool>;

    /// Permanently delete the live copy
    async fn delete(&self, hash: &BlobHash) -> Result<()>;

    /// List all live blobs
    async fn list(&self) -> Result<Vec<BlobHash>>;

    /// Move the live copy into the trash namespace
    async fn trash(&self, hash: &BlobHash) -> Result<()>;

    /// Move a trashed copy back into the live namespace
    async fn restore(&self, hash: &BlobHash) -> Result<()>;

    /// Erase a trashed copy, returning the bytes freed (0 if absent)
    async fn purge(&self, hash: &BlobHash) -> Result<u64>;

    /// List all trashed blobs
    async fn list_trash(&self) -> Result<Vec<BlobHash>>;

    /// Bytes held by live frames
    async fn usage(&self) -> Result<u64>;

    /// Short backend name for reporting
    fn backend_name(&self) -> &'static str;
}

/// A store that can move blobs between a hot and a cold tier
#[async_trait]
pub trait TieringCapableStore: BlobStore {
    /// Move a hot blob to the cold tier
    async fn cool_down(&self, hash: &BlobHash) -> Result<()>;

    /// Copy a cold blob into the hot tier
    async fn warm_up(&self, hash: &BlobHash) -> Result<()>;

    /// Which tiers currently hold a live copy
    async fn locate(&self, hash: &BlobHash) -> Result<Residency>;
}

/// The storage backend selected at construction
#[derive(Clone)]
pub enum StoreBackend {
    Local(Arc<LocalStore>),
    Hybrid(Arc<HybridStore>),
}

impl StoreBackend {
    /// Open the backend described by `config`
    pub async fn open(config: &EngineConfig, codec: Arc<BlobCodec>) -> Result<Self> {
        let hot = Arc::new(LocalStore::open(&config.local_path, codec.clone()).await?);
        match config.mode {
            StorageMode::Local => Ok(StoreBackend::Local(hot)),
            StorageMode::Hybrid => {
                let cold =
                    Arc::new(RemoteStore::new(&config.remote, config.retry.clone(), codec).await?);
                Ok(StoreBackend::Hybrid(Arc::new(HybridStore::new(
                    hot,
                    cold,
                    config.retain_cold_on_warm_up,
                ))))
            }
        }
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            StoreBackend::Local(_) => StorageMode::Local,
            StoreBackend::Hybrid(_) => StorageMode::Hybrid,
        }
    }

    /// The content-addressed view used by readers and writers
    pub fn store(&self) -> &dyn BlobStore {
        match self {
            StoreBackend::Local(local) => &**local,
            StoreBackend::Hybrid(hybrid) => &**hybrid,
        }
    }

    /// The hot tier
    pub fn hot(&self) -> &LocalStore {
        match self {
            StoreBackend::Local(local) => local,
            StoreBackend::Hybrid(hybrid) => hybrid.hot(),
        }
    }

    /// The tiering-capable store, in hybrid mode only
    pub fn hybrid(&self) -> Option<&Arc<HybridStore>> {
        match self {
            StoreBackend::Local(_) => None,
            StoreBackend::Hybrid(hybrid) => Some(hybrid),
        }
    }
}
