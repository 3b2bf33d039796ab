//! Per-hash exclusive sections
//!
//! Writers, movers and the garbage collector serialize on the hash they are
//! touching. Entries are weak so the table only holds hashes with a live
//! guard or waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OwnedMutexGuard;

use crate::hash::BlobHash;

/// Prune dead entries once the table grows past this many hashes
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct HashLocks {
    inner: Mutex<HashMap<BlobHash, Weak<tokio::sync::Mutex<()>>>>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `hash`
    pub async fn lock(&self, hash: &BlobHash) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, weak| weak.strong_count() > 0);
            }
            match map.get(hash).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(tokio::sync::Mutex::new(()));
                    map.insert(*hash, Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_hash_is_exclusive() {
        let locks = Arc::new(HashLocks::new());
        let hash = BlobHash::from_data(b"same");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&hash).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_hashes_do_not_block() {
        let locks = HashLocks::new();
        let a = locks.lock(&BlobHash::from_data(b"a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&BlobHash::from_data(b"b")),
        )
        .await;
        assert!(b.is_ok());
        drop(a);
    }

    #[tokio::test]
    async fn test_released_entries_are_not_tracked() {
        let locks = HashLocks::new();
        {
            let _g = locks.lock(&BlobHash::from_data(b"a")).await;
            assert_eq!(locks.tracked(), 1);
        }
        assert_eq!(locks.tracked(), 0);
    }
}
