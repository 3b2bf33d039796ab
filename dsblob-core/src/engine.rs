//! Engine handle
//!
//! Opening an [`Engine`] wires configuration, stores, index, collector and
//! verification together and hands back each capability directly.

use std::sync::Arc;
use tracing::info;

use crate::config::{EngineConfig, StorageMode};
use crate::error::{Result, StorageError};
use crate::gc::GarbageCollector;
use crate::ingest::Ingestion;
use crate::manager::{BlobManager, Stats};
use crate::oracle::{ReferenceOracle, SqliteReferenceOracle};
use crate::store::{HybridStore, TieringCapableStore};
use crate::tiering::TieringPolicyEngine;

/// An opened blob engine
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    manager: Arc<BlobManager>,
    gc: GarbageCollector,
    ingestion: Ingestion,
    tiering: TieringPolicyEngine,
}

impl Engine {
    /// Open the engine described by `config`, consulting `oracle` for
    /// blob references
    pub async fn open(config: EngineConfig, oracle: Arc<dyn ReferenceOracle>) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(BlobManager::open(&config).await?);
        let gc = GarbageCollector::new(manager.clone(), oracle.clone(), config.gc.clone());
        let ingestion = Ingestion::new(manager.clone(), oracle);
        let tiering = TieringPolicyEngine::new(manager.policy().clone());
        info!(
            mode = config.mode.as_str(),
            path = ?config.local_path,
            remote = config.remote.kind(),
            "Blob engine opened"
        );
        Ok(Self {
            config,
            manager,
            gc,
            ingestion,
            tiering,
        })
    }

    /// Open with the SQLite reference oracle named in `config.oracle`
    pub async fn open_with_configured_oracle(config: EngineConfig) -> Result<Self> {
        let oracle_config = config.oracle.clone().ok_or_else(|| {
            StorageError::Configuration("no reference oracle configured".to_string())
        })?;
        let oracle = Arc::new(SqliteReferenceOracle::open(&oracle_config)?);
        Self::open(config, oracle).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mode(&self) -> StorageMode {
        self.manager.mode()
    }

    pub fn manager(&self) -> &Arc<BlobManager> {
        &self.manager
    }

    /// The hybrid store, in hybrid mode only
    pub fn hybrid(&self) -> Option<Arc<HybridStore>> {
        self.manager.backend().hybrid().cloned()
    }

    /// The tier-moving capability, in hybrid mode only
    pub fn tiering_store(&self) -> Option<Arc<dyn TieringCapableStore>> {
        self.hybrid()
            .map(|hybrid| hybrid as Arc<dyn TieringCapableStore>)
    }

    pub fn tiering(&self) -> &TieringPolicyEngine {
        &self.tiering
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn ingestion(&self) -> &Ingestion {
        &self.ingestion
    }

    pub fn stats(&self) -> Result<Stats> {
        self.manager.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::oracle::MemoryReferenceOracle;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_engine_has_no_tiering() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(
            EngineConfig::local(dir.path().join("blobs")),
            Arc::new(MemoryReferenceOracle::new()),
        )
        .await
        .unwrap();
        assert_eq!(engine.mode(), StorageMode::Local);
        assert!(engine.hybrid().is_none());
        assert!(engine.tiering_store().is_none());
        assert_eq!(engine.stats().unwrap().backend, "local");
    }

    #[tokio::test]
    async fn test_hybrid_engine_exposes_tiering_store() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(
            EngineConfig::hybrid(dir.path().join("blobs"), RemoteConfig::Memory),
            Arc::new(MemoryReferenceOracle::new()),
        )
        .await
        .unwrap();
        let hash = engine
            .manager()
            .put(Bytes::from_static(b"tiered"))
            .await
            .unwrap();

        let tiering = engine.tiering_store().unwrap();
        tiering.cool_down(&hash).await.unwrap();
        let residency = tiering.locate(&hash).await.unwrap();
        assert!(residency.cold && !residency.hot);
        assert_eq!(engine.stats().unwrap().backend, "hybrid");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::local(dir.path().join("blobs"));
        config.retry.max_attempts = 0;
        let err = Engine::open(config, Arc::new(MemoryReferenceOracle::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_configured_oracle_required() {
        let dir = TempDir::new().unwrap();
        let err = Engine::open_with_configured_oracle(EngineConfig::local(dir.path().join("blobs")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }
}
