//! Cold tier on an object store (S3/MinIO, a local directory, or memory)
//!
//! Live frames are kept at `data/{hash}` and trashed frames at
//! `trash/{hash}`. Transient backend failures are retried with bounded
//! exponential backoff before surfacing as
//! [`StorageError::BackendUnavailable`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BlobStore, StoredBlob, Tier};
use crate::codec::{BlobCodec, FrameHeader, FrameInfo, HEADER_LEN};
use crate::config::{RemoteConfig, RetryConfig};
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;
use crate::locks::HashLocks;

const DATA_PREFIX: &str = "data";
const TRASH_PREFIX: &str = "trash";

/// Content-addressed store on top of an [`ObjectStore`]
pub struct RemoteStore {
    inner: Arc<dyn ObjectStore>,
    codec: Arc<BlobCodec>,
    locks: HashLocks,
    retry: RetryConfig,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("inner", &self.inner.to_string())
            .field("retry", &self.retry)
            .finish()
    }
}

impl RemoteStore {
    /// Create a remote store from configuration
    pub async fn new(
        config: &RemoteConfig,
        retry: RetryConfig,
        codec: Arc<BlobCodec>,
    ) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config {
            RemoteConfig::Memory => Arc::new(InMemory::new()),

            RemoteConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(path)
                        .map_err(|e| StorageError::Configuration(e.to_string()))?,
                )
            }

            RemoteConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| StorageError::Configuration(e.to_string()))?,
                );

                // Fail fast on a missing bucket
                let prefix = ObjectPath::from("");
                let mut stream = store.list(Some(&prefix));
                match stream.try_next().await {
                    Ok(_) => {}
                    Err(object_store::Error::NotFound { .. }) => {
                        return Err(StorageError::Configuration(format!(
                            "bucket not found: {}",
                            bucket
                        )));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("NoSuchBucket") {
                            return Err(StorageError::Configuration(format!(
                                "bucket not found: {}",
                                bucket
                            )));
                        }
                        return Err(StorageError::BackendUnavailable(msg));
                    }
                }
                drop(stream);

                store
            }
        };

        debug!("Opened {} cold tier", config.kind());
        Ok(Self::from_object_store(inner, retry, codec))
    }

    /// In-memory remote store
    pub fn memory(codec: Arc<BlobCodec>) -> Self {
        Self::from_object_store(Arc::new(InMemory::new()), RetryConfig::default(), codec)
    }

    /// Wrap an already constructed object store
    pub fn from_object_store(
        inner: Arc<dyn ObjectStore>,
        retry: RetryConfig,
        codec: Arc<BlobCodec>,
    ) -> Self {
        Self {
            inner,
            codec,
            locks: HashLocks::new(),
            retry,
        }
    }

    fn data_path(hash: &BlobHash) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", DATA_PREFIX, hash))
    }

    fn trash_path(hash: &BlobHash) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", TRASH_PREFIX, hash))
    }

    /// Run `op`, retrying transient failures with backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> object_store::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if is_transient(&e) && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Cold tier {} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch(&self, path: &ObjectPath) -> object_store::Result<Bytes> {
        let inner = &self.inner;
        self.with_retry("get", move || async move {
            inner.get(path).await?.bytes().await
        })
        .await
    }

    async fn meta(&self, path: &ObjectPath) -> object_store::Result<ObjectMeta> {
        let inner = &self.inner;
        self.with_retry("head", move || inner.head(path)).await
    }

    async fn write(&self, path: &ObjectPath, bytes: Bytes) -> object_store::Result<()> {
        let inner = &self.inner;
        self.with_retry("put", move || {
            let payload = bytes.clone();
            async move { inner.put(path, payload.into()).await.map(|_| ()) }
        })
        .await
    }

    async fn remove(&self, path: &ObjectPath) -> object_store::Result<()> {
        let inner = &self.inner;
        match self.with_retry("delete", move || inner.delete(path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        let inner = &self.inner;
        self.with_retry("copy", move || inner.copy(from, to)).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let inner = &self.inner;
        let prefix = ObjectPath::from(prefix);
        let prefix = &prefix;
        self.with_retry("list", move || {
            inner.list(Some(prefix)).try_collect::<Vec<_>>()
        })
        .await
        .map_err(|e| remote_error(None, e))
    }

    async fn present(&self, path: &ObjectPath, hash: &BlobHash) -> Result<bool> {
        match self.meta(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(remote_error(Some(hash), e)),
        }
    }
}

fn is_transient(e: &object_store::Error) -> bool {
    matches!(
        e,
        object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
    )
}

fn remote_error(hash: Option<&BlobHash>, e: object_store::Error) -> StorageError {
    match (hash, e) {
        (Some(hash), object_store::Error::NotFound { .. }) => StorageError::NotFound(*hash),
        (_, e) if is_transient(&e) => StorageError::BackendUnavailable(e.to_string()),
        (_, e) => StorageError::Backend(e.to_string()),
    }
}

fn hashes_of(metas: Vec<ObjectMeta>) -> Vec<BlobHash> {
    let mut hashes: Vec<BlobHash> = metas
        .iter()
        .filter_map(|meta| meta.location.filename())
        .filter_map(|name| BlobHash::from_hex(name).ok())
        .collect();
    hashes.sort();
    hashes
}

#[async_trait]
impl BlobStore for RemoteStore {
    async fn put_blob(&self, data: Bytes) -> Result<StoredBlob> {
        let hash = BlobHash::from_data(&data);
        let _guard = self.locks.lock(&hash).await;

        match self.head(&hash).await {
            Ok(info) => {
                return Ok(StoredBlob::existing(hash, data.len() as u64, info, Tier::Cold));
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) if e.is_corruption() => {
                warn!("Overwriting corrupt cold frame for {}: {}", hash, e);
            }
            Err(e) => return Err(e),
        }

        let frame = self.codec.encode(&data)?;
        self.write(&Self::data_path(&hash), frame.bytes.clone())
            .await
            .map_err(|e| remote_error(Some(&hash), e))?;
        debug!("Stored blob {} ({} bytes) in cold tier", hash, data.len());

        Ok(StoredBlob {
            hash,
            size: data.len() as u64,
            stored_size: frame.bytes.len() as u64,
            compression: frame.header.compression,
            encrypted: frame.header.encrypted,
            tier: Tier::Cold,
            newly_written: true,
        })
    }

    async fn get(&self, hash: &BlobHash) -> Result<Bytes> {
        let frame = self
            .fetch(&Self::data_path(hash))
            .await
            .map_err(|e| remote_error(Some(hash), e))?;
        self.codec.open(hash, &frame)
    }

    async fn head(&self, hash: &BlobHash) -> Result<FrameInfo> {
        let path = Self::data_path(hash);
        let meta = self
            .meta(&path)
            .await
            .map_err(|e| remote_error(Some(hash), e))?;
        if meta.size < HEADER_LEN {
            return Err(StorageError::Corrupt {
                hash: *hash,
                reason: format!("frame too short ({} bytes)", meta.size),
            });
        }

        let inner = &self.inner;
        let path = &path;
        let header = self
            .with_retry("get_range", move || inner.get_range(path, 0..HEADER_LEN))
            .await
            .map_err(|e| remote_error(Some(hash), e))?;
        let header = FrameHeader::parse(&header).map_err(|reason| StorageError::Corrupt {
            hash: *hash,
            reason,
        })?;

        Ok(FrameInfo {
            stored_size: meta.size as u64,
            compression: header.compression,
            encrypted: header.encrypted,
        })
    }

    async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        self.present(&Self::data_path(hash), hash).await
    }

    async fn delete(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        self.remove(&Self::data_path(hash))
            .await
            .map_err(|e| remote_error(Some(hash), e))
    }

    async fn list(&self) -> Result<Vec<BlobHash>> {
        Ok(hashes_of(self.list_prefix(DATA_PREFIX).await?))
    }

    async fn trash(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        let live = Self::data_path(hash);
        let trashed = Self::trash_path(hash);
        self.copy(&live, &trashed)
            .await
            .map_err(|e| remote_error(Some(hash), e))?;
        self.remove(&live)
            .await
            .map_err(|e| remote_error(Some(hash), e))
    }

    async fn restore(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        let live = Self::data_path(hash);
        let trashed = Self::trash_path(hash);
        if !self.present(&live, hash).await? {
            self.copy(&trashed, &live)
                .await
                .map_err(|e| remote_error(Some(hash), e))?;
        } else if !self.present(&trashed, hash).await? {
            return Ok(());
        }
        self.remove(&trashed)
            .await
            .map_err(|e| remote_error(Some(hash), e))
    }

    async fn purge(&self, hash: &BlobHash) -> Result<u64> {
        let path = Self::trash_path(hash);
        let size = match self.meta(&path).await {
            Ok(meta) => meta.size as u64,
            Err(object_store::Error::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(remote_error(Some(hash), e)),
        };
        self.remove(&path)
            .await
            .map_err(|e| remote_error(Some(hash), e))?;
        Ok(size)
    }

    async fn list_trash(&self) -> Result<Vec<BlobHash>> {
        Ok(hashes_of(self.list_prefix(TRASH_PREFIX).await?))
    }

    async fn usage(&self) -> Result<u64> {
        Ok(self
            .list_prefix(DATA_PREFIX)
            .await?
            .iter()
            .map(|meta| meta.size as u64)
            .sum())
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }
}
