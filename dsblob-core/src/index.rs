//! SQLite blob index
//!
//! Records every live blob (size, frame facts, tier, timestamps, access
//! statistics) and every trashed blob with the time it was trashed. The
//! index is the source of truth for ages, tiering decisions and
//! [`Stats`](crate::manager::Stats); the stores are the source of truth for
//! bytes, and [`BlobManager::rebuild_index`](crate::manager::BlobManager::rebuild_index)
//! reconciles the two.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::codec::Compression;
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;
use crate::store::{StoredBlob, Tier};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blobs (
    hash TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    stored_size INTEGER NOT NULL,
    compression TEXT NOT NULL,
    encrypted INTEGER NOT NULL,
    key_id TEXT,
    tier TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    touched_at INTEGER NOT NULL,
    last_accessed_at INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS blobs_tier ON blobs (tier);
CREATE TABLE IF NOT EXISTS trash (
    hash TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    stored_size INTEGER NOT NULL,
    compression TEXT NOT NULL,
    encrypted INTEGER NOT NULL,
    key_id TEXT,
    tier TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    touched_at INTEGER NOT NULL,
    last_accessed_at INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER NOT NULL
) WITHOUT ROWID;
";

const COLUMNS: &str = "hash, size, stored_size, compression, encrypted, key_id, tier, \
                       created_at, touched_at, last_accessed_at, access_count";

/// Index entry for a live blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobRecord {
    pub hash: BlobHash,
    pub size: u64,
    pub stored_size: u64,
    pub compression: Compression,
    pub encrypted: bool,
    /// Key the frame was sealed with
    pub key_id: Option<String>,
    /// Authoritative tier
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    /// Last time a writer stored this content
    pub touched_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Reads since the blob last changed tier
    pub access_count: u64,
}

impl BlobRecord {
    pub fn new(stored: &StoredBlob, key_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            hash: stored.hash,
            size: stored.size,
            stored_size: stored.stored_size,
            compression: stored.compression,
            encrypted: stored.encrypted,
            key_id: if stored.encrypted {
                key_id.map(str::to_string)
            } else {
                None
            },
            tier: stored.tier,
            created_at: now,
            touched_at: now,
            last_accessed_at: None,
            access_count: 0,
        }
    }

    /// Most recent time anything wrote or read this blob
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.last_accessed_at {
            Some(accessed) if accessed > self.touched_at => accessed,
            _ => self.touched_at,
        }
    }
}

/// Index entry for a trashed blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrashEntry {
    #[serde(flatten)]
    pub record: BlobRecord,
    pub deleted_at: DateTime<Utc>,
}

/// Aggregates over the index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub total_blobs: u64,
    pub total_size: u64,
    pub total_stored_size: u64,
    pub hot_bytes: u64,
    pub cold_bytes: u64,
    pub oldest_blob: Option<DateTime<Utc>>,
    pub newest_blob: Option<DateTime<Utc>>,
    pub trashed_blobs: u64,
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BlobRecord> {
    let hex: String = row.get(0)?;
    let hash = BlobHash::from_hex(&hex)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let compression: String = row.get(3)?;
    let tier: String = row.get(6)?;
    let last_accessed: Option<i64> = row.get(9)?;
    Ok(BlobRecord {
        hash,
        size: row.get::<_, i64>(1)? as u64,
        stored_size: row.get::<_, i64>(2)? as u64,
        compression: Compression::parse(&compression),
        encrypted: row.get(4)?,
        key_id: row.get(5)?,
        tier: Tier::parse(&tier),
        created_at: from_millis(row.get(7)?),
        touched_at: from_millis(row.get(8)?),
        last_accessed_at: last_accessed.map(from_millis),
        access_count: row.get::<_, i64>(10)? as u64,
    })
}

fn trash_from_row(row: &Row<'_>) -> rusqlite::Result<TrashEntry> {
    Ok(TrashEntry {
        record: record_from_row(row)?,
        deleted_at: from_millis(row.get(11)?),
    })
}

/// Blob metadata index backed by SQLite
pub struct BlobIndex {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for BlobIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobIndex").finish_non_exhaustive()
    }
}

impl BlobIndex {
    /// Open (or create) the index database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Self::init(conn)
    }

    /// Index held in memory only
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("index connection poisoned".to_string()))
    }

    /// Insert or replace the record for `record.hash`
    pub fn insert(&self, record: &BlobRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO blobs ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                COLUMNS
            ),
            params![
                record.hash.to_hex(),
                record.size as i64,
                record.stored_size as i64,
                record.compression.as_str(),
                record.encrypted,
                record.key_id,
                record.tier.as_str(),
                millis(record.created_at),
                millis(record.touched_at),
                record.last_accessed_at.map(millis),
                record.access_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, hash: &BlobHash) -> Result<Option<BlobRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM blobs WHERE hash = ?1", COLUMNS),
                params![hash.to_hex()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn contains(&self, hash: &BlobHash) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blobs WHERE hash = ?1",
                params![hash.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Drop the record for `hash`, returning whether one existed
    pub fn remove(&self, hash: &BlobHash) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM blobs WHERE hash = ?1", params![hash.to_hex()])?;
        Ok(n > 0)
    }

    /// All live records, oldest first
    pub fn list(&self) -> Result<Vec<BlobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blobs ORDER BY created_at, hash",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count a read of `hash`
    pub fn record_access(&self, hash: &BlobHash, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE blobs SET last_accessed_at = ?2, access_count = access_count + 1 WHERE hash = ?1",
            params![hash.to_hex(), millis(now)],
        )?;
        Ok(())
    }

    /// Mark `hash` as freshly written
    pub fn touch(&self, hash: &BlobHash, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE blobs SET touched_at = ?2 WHERE hash = ?1",
            params![hash.to_hex(), millis(now)],
        )?;
        Ok(())
    }

    /// Record a tier move; the access count restarts in the new tier
    pub fn set_tier(&self, hash: &BlobHash, tier: Tier) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE blobs SET tier = ?2, access_count = 0 WHERE hash = ?1",
            params![hash.to_hex(), tier.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Move the live record for `hash` into the trash table
    pub fn move_to_trash(&self, hash: &BlobHash, now: DateTime<Utc>) -> Result<Option<TrashEntry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let record = tx
            .query_row(
                &format!("SELECT {} FROM blobs WHERE hash = ?1", COLUMNS),
                params![hash.to_hex()],
                record_from_row,
            )
            .optional()?;
        let Some(record) = record else {
            return Ok(None);
        };
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO trash ({}, deleted_at) SELECT {}, ?2 FROM blobs WHERE hash = ?1",
                COLUMNS, COLUMNS
            ),
            params![hash.to_hex(), millis(now)],
        )?;
        tx.execute("DELETE FROM blobs WHERE hash = ?1", params![hash.to_hex()])?;
        tx.commit()?;
        Ok(Some(TrashEntry {
            record,
            deleted_at: now,
        }))
    }

    /// Move a trashed record back to the live table
    pub fn restore_from_trash(
        &self,
        hash: &BlobHash,
        now: DateTime<Utc>,
    ) -> Result<Option<BlobRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let entry = tx
            .query_row(
                &format!("SELECT {}, deleted_at FROM trash WHERE hash = ?1", COLUMNS),
                params![hash.to_hex()],
                trash_from_row,
            )
            .optional()?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        let mut record = entry.record;
        record.touched_at = now;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO blobs ({}) SELECT {} FROM trash WHERE hash = ?1",
                COLUMNS, COLUMNS
            ),
            params![hash.to_hex()],
        )?;
        tx.execute(
            "UPDATE blobs SET touched_at = ?2 WHERE hash = ?1",
            params![hash.to_hex(), millis(now)],
        )?;
        tx.execute("DELETE FROM trash WHERE hash = ?1", params![hash.to_hex()])?;
        tx.commit()?;
        Ok(Some(record))
    }

    pub fn trash_entry(&self, hash: &BlobHash) -> Result<Option<TrashEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {}, deleted_at FROM trash WHERE hash = ?1", COLUMNS),
                params![hash.to_hex()],
                trash_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Trashed entries, earliest trashed first
    pub fn list_trash(&self) -> Result<Vec<TrashEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, deleted_at FROM trash ORDER BY deleted_at, hash",
            COLUMNS
        ))?;
        let rows = stmt.query_map([], trash_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove_trash(&self, hash: &BlobHash) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM trash WHERE hash = ?1", params![hash.to_hex()])?;
        Ok(n > 0)
    }

    /// Insert a trash entry directly (used when re-indexing the trash namespace)
    pub fn insert_trash(&self, entry: &TrashEntry) -> Result<()> {
        let conn = self.conn()?;
        let r = &entry.record;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO trash ({}, deleted_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                COLUMNS
            ),
            params![
                r.hash.to_hex(),
                r.size as i64,
                r.stored_size as i64,
                r.compression.as_str(),
                r.encrypted,
                r.key_id,
                r.tier.as_str(),
                millis(r.created_at),
                millis(r.touched_at),
                r.last_accessed_at.map(millis),
                r.access_count as i64,
                millis(entry.deleted_at),
            ],
        )?;
        Ok(())
    }

    /// Stored bytes recorded in the hot tier
    pub fn tier_bytes(&self, tier: Tier) -> Result<u64> {
        let conn = self.conn()?;
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(stored_size), 0) FROM blobs WHERE tier = ?1",
            params![tier.as_str()],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    pub fn summary(&self) -> Result<IndexSummary> {
        let conn = self.conn()?;
        let (total_blobs, total_size, total_stored_size, oldest, newest) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(SUM(stored_size), 0), \
             MIN(created_at), MAX(created_at) FROM blobs",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )?;

        let mut summary = IndexSummary {
            total_blobs: total_blobs as u64,
            total_size: total_size as u64,
            total_stored_size: total_stored_size as u64,
            oldest_blob: oldest.map(from_millis),
            newest_blob: newest.map(from_millis),
            ..Default::default()
        };

        let mut stmt =
            conn.prepare("SELECT tier, COALESCE(SUM(stored_size), 0) FROM blobs GROUP BY tier")?;
        let tiers = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for tier in tiers {
            let (tier, bytes) = tier?;
            match Tier::parse(&tier) {
                Tier::Hot => summary.hot_bytes += bytes as u64,
                Tier::Cold => summary.cold_bytes += bytes as u64,
            }
        }

        let trashed: i64 = conn.query_row("SELECT COUNT(*) FROM trash", [], |row| row.get(0))?;
        summary.trashed_blobs = trashed as u64;
        Ok(summary)
    }
}
