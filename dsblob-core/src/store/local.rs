//! Hot tier on the local filesystem
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/{hh}/{rest}   live frames, sharded by the first hash byte
//! trash/{hh}/{rest}     trashed frames, same sharding
//! tmp/                  in-flight writes, renamed into place when complete
//! ```
//!
//! A frame only becomes visible under `objects/` through an atomic rename, so
//! readers never observe a partial blob.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{BlobStore, StoredBlob, Tier};
use crate::codec::{BlobCodec, FrameHeader, FrameInfo, HEADER_LEN};
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;
use crate::locks::HashLocks;

const OBJECTS_DIR: &str = "objects";
const TRASH_DIR: &str = "trash";
const TMP_DIR: &str = "tmp";

/// Content-addressed store on a local directory
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    codec: Arc<BlobCodec>,
    locks: HashLocks,
}

impl LocalStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub async fn open(root: &Path, codec: Arc<BlobCodec>) -> Result<Self> {
        for dir in [OBJECTS_DIR, TRASH_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }

        let mut stale = 0usize;
        let mut entries = fs::read_dir(root.join(TMP_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("Failed to remove stale temp file {:?}: {}", entry.path(), e);
            } else {
                stale += 1;
            }
        }
        if stale > 0 {
            info!("Removed {} stale temp files from {:?}", stale, root);
        }

        Ok(Self {
            root: root.to_path_buf(),
            codec,
            locks: HashLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the live frame for `hash`
    pub fn object_path(&self, hash: &BlobHash) -> PathBuf {
        let (dir, rest) = hash.shard();
        self.root.join(OBJECTS_DIR).join(dir).join(rest)
    }

    /// Path of the trashed frame for `hash`
    pub fn trash_path(&self, hash: &BlobHash) -> PathBuf {
        let (dir, rest) = hash.shard();
        self.root.join(TRASH_DIR).join(dir).join(rest)
    }

    async fn write_frame(&self, hash: &BlobHash, frame: &[u8]) -> Result<()> {
        let path = self.object_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}.tmp", hash, uuid::Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(frame).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        }
        .await;
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = ?tmp_path, "Failed to remove temp file: {}", cleanup);
                }
            }
            return Err(e.into());
        }

        #[cfg(unix)]
        {
            if let Some(parent) = path.parent() {
                let synced = match fs::File::open(parent).await {
                    Ok(dir) => dir.sync_all().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = synced {
                    warn!(path = ?parent, "Failed to sync directory: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn frame_info(&self, hash: &BlobHash, path: &Path) -> Result<FrameInfo> {
        let mut file = fs::File::open(path).await.map_err(|e| not_found(hash, e))?;
        let stored_size = file.metadata().await?.len();
        let mut header = [0u8; HEADER_LEN];
        if let Err(e) = file.read_exact(&mut header).await {
            if e.kind() == ErrorKind::UnexpectedEof {
                return Err(StorageError::Corrupt {
                    hash: *hash,
                    reason: format!("frame too short ({} bytes)", stored_size),
                });
            }
            return Err(e.into());
        }
        let header = FrameHeader::parse(&header).map_err(|reason| StorageError::Corrupt {
            hash: *hash,
            reason,
        })?;
        Ok(FrameInfo {
            stored_size,
            compression: header.compression,
            encrypted: header.encrypted,
        })
    }

    /// Move a frame between namespaces, failing with NotFound if `from` is absent
    async fn move_frame(&self, hash: &BlobHash, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, to).await.map_err(|e| not_found(hash, e))
    }
}

fn not_found(hash: &BlobHash, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(*hash)
    } else {
        StorageError::Io(e)
    }
}

/// Walk a two-level shard directory and collect the hashes found
async fn scan_shards(base: &Path) -> Result<Vec<BlobHash>> {
    let mut hashes = Vec::new();
    let mut shards = match fs::read_dir(base).await {
        Ok(shards) => shards,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(hashes),
        Err(e) => return Err(e.into()),
    };
    while let Some(shard) = shards.next_entry().await? {
        if !shard.file_type().await?.is_dir() {
            continue;
        }
        let prefix = shard.file_name().to_string_lossy().into_owned();
        let mut files = fs::read_dir(shard.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let name = format!("{}{}", prefix, file.file_name().to_string_lossy());
            match BlobHash::from_hex(&name) {
                Ok(hash) => hashes.push(hash),
                Err(_) => debug!("Ignoring foreign file {:?}", file.path()),
            }
        }
    }
    hashes.sort();
    Ok(hashes)
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put_blob(&self, data: Bytes) -> Result<StoredBlob> {
        let hash = BlobHash::from_data(&data);
        let _guard = self.locks.lock(&hash).await;

        let path = self.object_path(&hash);
        if fs::try_exists(&path).await? {
            let info = self.frame_info(&hash, &path).await?;
            return Ok(StoredBlob::existing(hash, data.len() as u64, info, Tier::Hot));
        }

        let frame = self.codec.encode(&data)?;
        self.write_frame(&hash, &frame.bytes).await?;
        debug!("Stored blob {} ({} bytes) in hot tier", hash, data.len());

        Ok(StoredBlob {
            hash,
            size: data.len() as u64,
            stored_size: frame.bytes.len() as u64,
            compression: frame.header.compression,
            encrypted: frame.header.encrypted,
            tier: Tier::Hot,
            newly_written: true,
        })
    }

    async fn get(&self, hash: &BlobHash) -> Result<Bytes> {
        let frame = fs::read(self.object_path(hash))
            .await
            .map_err(|e| not_found(hash, e))?;
        self.codec.open(hash, &frame)
    }

    async fn head(&self, hash: &BlobHash) -> Result<FrameInfo> {
        self.frame_info(hash, &self.object_path(hash)).await
    }

    async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(hash)).await?)
    }

    async fn delete(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        match fs::remove_file(self.object_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<BlobHash>> {
        scan_shards(&self.root.join(OBJECTS_DIR)).await
    }

    async fn trash(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        self.move_frame(hash, &self.object_path(hash), &self.trash_path(hash))
            .await
    }

    async fn restore(&self, hash: &BlobHash) -> Result<()> {
        let _guard = self.locks.lock(hash).await;
        let live = self.object_path(hash);
        if fs::try_exists(&live).await? {
            // Content was rewritten since it was trashed
            match fs::remove_file(self.trash_path(hash)).await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    warn!(hash = %hash, "Failed to drop stale trash copy: {}", e);
                }
                _ => {}
            }
            return Ok(());
        }
        self.move_frame(hash, &self.trash_path(hash), &live).await
    }

    async fn purge(&self, hash: &BlobHash) -> Result<u64> {
        let path = self.trash_path(hash);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_trash(&self) -> Result<Vec<BlobHash>> {
        scan_shards(&self.root.join(TRASH_DIR)).await
    }

    async fn usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for hash in self.list().await? {
            match fs::metadata(self.object_path(&hash)).await {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> LocalStore {
        LocalStore::open(dir.path(), Arc::new(BlobCodec::with_options(Some(3), None)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let data = Bytes::from_static(b"hello world");
        let stored = store.put_blob(data.clone()).await.unwrap();
        assert!(stored.newly_written);
        assert_eq!(stored.tier, Tier::Hot);
        assert_eq!(stored.hash, BlobHash::from_data(&data));

        let retrieved = store.get(&stored.hash).await.unwrap();
        assert_eq!(retrieved, data);
        assert!(store.object_path(&stored.hash).exists());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let data = Bytes::from(vec![b'z'; 4096]);
        let first = store.put_blob(data.clone()).await.unwrap();
        let second = store.put_blob(data).await.unwrap();
        assert!(first.newly_written);
        assert!(!second.newly_written);
        assert_eq!(first.stored_size, second.stored_size);
        assert_eq!(store.list().await.unwrap(), vec![first.hash]);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let hash = BlobHash::from_data(b"never stored");

        assert!(store.get(&hash).await.unwrap_err().is_not_found());
        assert!(store.head(&hash).await.unwrap_err().is_not_found());
        assert!(!store.exists(&hash).await.unwrap());
        store.delete(&hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path(), Arc::new(BlobCodec::plain()))
            .await
            .unwrap();
        let hash = store.put(Bytes::from_static(b"original bytes")).await.unwrap();

        let path = store.object_path(&hash);
        let mut frame = std::fs::read(&path).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        std::fs::write(&path, frame).unwrap();

        let err = store.get(&hash).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_trash_restore_purge() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let hash = store.put(Bytes::from_static(b"to be trashed")).await.unwrap();

        store.trash(&hash).await.unwrap();
        assert!(!store.exists(&hash).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.list_trash().await.unwrap(), vec![hash]);

        store.restore(&hash).await.unwrap();
        assert_eq!(
            store.get(&hash).await.unwrap(),
            Bytes::from_static(b"to be trashed")
        );

        store.trash(&hash).await.unwrap();
        let freed = store.purge(&hash).await.unwrap();
        assert!(freed > 0);
        assert!(store.list_trash().await.unwrap().is_empty());
        assert_eq!(store.purge(&hash).await.unwrap(), 0);
        assert!(store.restore(&hash).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restore_after_rewrite_drops_trash_copy() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let data = Bytes::from_static(b"written twice");
        let hash = store.put(data.clone()).await.unwrap();
        store.trash(&hash).await.unwrap();
        store.put(data.clone()).await.unwrap();

        store.restore(&hash).await.unwrap();
        assert!(store.list_trash().await.unwrap().is_empty());
        assert_eq!(store.get(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_restore_after_rewrite_tolerates_stuck_trash_copy() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let data = Bytes::from_static(b"stuck in trash");
        let hash = store.put(data.clone()).await.unwrap();
        store.trash(&hash).await.unwrap();
        store.put(data.clone()).await.unwrap();

        // A directory where the trash frame should be cannot be unlinked
        let trash_path = store.trash_path(&hash);
        std::fs::remove_file(&trash_path).unwrap();
        std::fs::create_dir(&trash_path).unwrap();
        std::fs::write(trash_path.join("inner"), b"x").unwrap();

        store.restore(&hash).await.unwrap();
        assert!(trash_path.exists());
        assert_eq!(store.get(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_usage_and_head() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let a = store.put_blob(Bytes::from(vec![b'a'; 10_000])).await.unwrap();
        let b = store.put_blob(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(store.usage().await.unwrap(), a.stored_size + b.stored_size);

        let info = store.head(&a.hash).await.unwrap();
        assert_eq!(info.stored_size, a.stored_size);
        assert_eq!(info.compression, a.compression);
    }

    #[tokio::test]
    async fn test_open_clears_stale_tmp() {
        let dir = TempDir::new().unwrap();
        {
            let _store = open_store(&dir).await;
        }
        let stale = dir.path().join(TMP_DIR).join("half-written.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        let store = open_store(&dir).await;
        assert!(!stale.exists());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_same_content() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir).await);
        let data = Bytes::from(vec![7u8; 64 * 1024]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            handles.push(tokio::spawn(async move { store.put_blob(data).await }));
        }
        let mut written = 0;
        for h in handles {
            if h.await.unwrap().unwrap().newly_written {
                written += 1;
            }
        }
        assert_eq!(written, 1);
        assert_eq!(store.get(&BlobHash::from_data(&data)).await.unwrap(), data);
    }
}
