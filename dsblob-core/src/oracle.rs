//! Read-only view of which blobs the outside world still references
//!
//! The engine never writes through a [`ReferenceOracle`]. Dataset metadata
//! lives elsewhere (usually a SQLite database owned by the ingestion
//! service); the garbage collector and integrity checks only ask it two
//! questions.

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::OracleConfig;
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;

/// Source of truth for blob liveness
#[async_trait]
pub trait ReferenceOracle: Send + Sync {
    /// Every hash referenced by any live dataset version
    async fn live_references(&self) -> Result<HashSet<BlobHash>>;

    /// Hashes referenced by one dataset version, or `None` if it is unknown
    async fn version_references(&self, version_id: &str) -> Result<Option<HashSet<BlobHash>>>;
}

/// In-memory oracle, useful for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryReferenceOracle {
    versions: RwLock<HashMap<String, HashSet<BlobHash>>>,
}

impl MemoryReferenceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the references of `version_id`
    pub async fn set_version(&self, version_id: impl Into<String>, hashes: impl IntoIterator<Item = BlobHash>) {
        self.versions
            .write()
            .await
            .insert(version_id.into(), hashes.into_iter().collect());
    }

    pub async fn add_reference(&self, version_id: &str, hash: BlobHash) {
        self.versions
            .write()
            .await
            .entry(version_id.to_string())
            .or_default()
            .insert(hash);
    }

    pub async fn remove_reference(&self, version_id: &str, hash: &BlobHash) {
        if let Some(set) = self.versions.write().await.get_mut(version_id) {
            set.remove(hash);
        }
    }

    pub async fn remove_version(&self, version_id: &str) {
        self.versions.write().await.remove(version_id);
    }
}

#[async_trait]
impl ReferenceOracle for MemoryReferenceOracle {
    async fn live_references(&self) -> Result<HashSet<BlobHash>> {
        Ok(self
            .versions
            .read()
            .await
            .values()
            .flat_map(|set| set.iter().copied())
            .collect())
    }

    async fn version_references(&self, version_id: &str) -> Result<Option<HashSet<BlobHash>>> {
        Ok(self.versions.read().await.get(version_id).cloned())
    }
}

/// Oracle backed by an external SQLite database, opened read-only
///
/// `live_query` must return one hex hash per row. `version_query` takes the
/// version id as `?1`; a version with no rows is reported as unknown.
pub struct SqliteReferenceOracle {
    conn: Mutex<Connection>,
    live_query: String,
    version_query: String,
}

impl std::fmt::Debug for SqliteReferenceOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReferenceOracle")
            .field("live_query", &self.live_query)
            .field("version_query", &self.version_query)
            .finish()
    }
}

impl SqliteReferenceOracle {
    pub fn open(config: &OracleConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            StorageError::Configuration(format!(
                "cannot open reference database {:?}: {}",
                config.path, e
            ))
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
            live_query: config.live_query.clone(),
            version_query: config.version_query.clone(),
        })
    }

    fn query_hashes(&self, sql: &str, version_id: Option<&str>) -> Result<(usize, HashSet<BlobHash>)> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Database("reference connection poisoned".to_string()))?;
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<String> = match version_id {
            Some(id) => stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
        };

        let mut hashes = HashSet::with_capacity(rows.len());
        for hex in &rows {
            match BlobHash::from_hex(hex.trim()) {
                Ok(hash) => {
                    hashes.insert(hash);
                }
                Err(e) => warn!("Skipping malformed blob reference {:?}: {}", hex, e),
            }
        }
        Ok((rows.len(), hashes))
    }

    /// Whether the database knows `version_id` at all
    fn version_known(&self, version_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Database("reference connection poisoned".to_string()))?;
        let known: Option<String> = conn
            .query_row(&self.version_query, params![version_id], |row| row.get(0))
            .optional()?;
        Ok(known.is_some())
    }
}

#[async_trait]
impl ReferenceOracle for SqliteReferenceOracle {
    async fn live_references(&self) -> Result<HashSet<BlobHash>> {
        let (_, hashes) = self.query_hashes(&self.live_query, None)?;
        Ok(hashes)
    }

    async fn version_references(&self, version_id: &str) -> Result<Option<HashSet<BlobHash>>> {
        if !self.version_known(version_id)? {
            return Ok(None);
        }
        let (rows, hashes) = self.query_hashes(&self.version_query, Some(version_id))?;
        if rows > hashes.len() {
            // A malformed reference makes the version impossible to verify
            return Err(StorageError::Serialization(format!(
                "dataset version {} has {} malformed blob references",
                version_id,
                rows - hashes.len()
            )));
        }
        Ok(Some(hashes))
    }
}
