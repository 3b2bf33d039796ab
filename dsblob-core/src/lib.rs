//! DSBlob Core Library
//!
//! Content-addressed blob storage for a replicated dataset store:
//! - Content addressing (SHA-256) and at-rest framing (zstd, ChaCha20-Poly1305)
//! - Local hot tier, object-store cold tier and the hybrid of both
//! - SQLite blob index with access statistics and trash bookkeeping
//! - Garbage collection against a read-only reference oracle
//! - Tiering policy engine
//! - Dataset version integrity verification

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gc;
pub mod hash;
pub mod index;
pub mod ingest;
mod locks;
pub mod manager;
pub mod oracle;
pub mod store;
pub mod tiering;

pub use codec::{BlobCodec, Compression, FrameInfo};
pub use config::{
    CompressionConfig, EncryptionConfig, EngineConfig, GcConfig, OracleConfig, RemoteConfig,
    RetryConfig, StorageMode, TieringPolicy,
};
pub use engine::Engine;
pub use error::{ItemFailure, Result, StorageError};
pub use gc::{GarbageCollector, GcOptions, GcPhase, GcRunRecord, GcSkipReason};
pub use hash::BlobHash;
pub use index::{BlobIndex, BlobRecord, TrashEntry};
pub use ingest::{Ingestion, IntegrityReport};
pub use manager::{BlobManager, ReindexReport, Stats};
pub use oracle::{MemoryReferenceOracle, ReferenceOracle, SqliteReferenceOracle};
pub use store::{
    BlobStore, HybridStore, LocalStore, RemoteStore, Residency, StoreBackend, StoredBlob, Tier,
    TieringCapableStore,
};
pub use tiering::{TieringAction, TieringPlan, TieringPolicyEngine, TieringReport};

/// Cancellation signal accepted by long-running operations
pub use tokio_util::sync::CancellationToken;
