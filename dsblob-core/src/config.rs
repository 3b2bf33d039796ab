//! Engine configuration
//!
//! Everything that drives engine behaviour is carried in an explicit
//! [`EngineConfig`] handed to the constructors. It is stored as JSON next to
//! the data (or anywhere the operator likes) and every field has a default, so
//! a partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StorageError};

/// How blobs are laid out across tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Hot tier only
    #[default]
    Local,
    /// Hot local tier plus a cold remote tier
    Hybrid,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::Hybrid => "hybrid",
        }
    }
}

/// Backend for the cold tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage
    Local {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

impl RemoteConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteConfig::Memory => "memory",
            RemoteConfig::Local { .. } => "local",
            RemoteConfig::S3 { .. } => "s3",
        }
    }
}

/// Bounded exponential backoff for transient cold-tier failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// At-rest compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// zstd level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 3,
        }
    }
}

/// At-rest encryption
///
/// Only a key reference is recorded alongside blobs. The key itself comes
/// from `key_hex` or from the environment variable named by `key_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key_id: String,
    pub key_hex: Option<String>,
    pub key_env: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: "default".to_string(),
            key_hex: None,
            key_env: Some("DSBLOB_ENCRYPTION_KEY".to_string()),
        }
    }
}

impl EncryptionConfig {
    /// Resolve the 256-bit key, if encryption is enabled
    pub fn resolve_key(&self) -> Result<Option<[u8; 32]>> {
        if !self.enabled {
            return Ok(None);
        }
        let hex_key = match (&self.key_hex, &self.key_env) {
            (Some(k), _) => k.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                StorageError::Configuration(format!(
                    "encryption enabled but environment variable {} is not set",
                    var
                ))
            })?,
            (None, None) => {
                return Err(StorageError::Configuration(
                    "encryption enabled but no key source configured".to_string(),
                ));
            }
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| StorageError::Configuration(format!("invalid encryption key: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            StorageError::Configuration(format!(
                "encryption key must be 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Some(key))
    }
}

/// Thresholds consulted by the tiering policy engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringPolicy {
    /// Hot-tier footprint budget (stored bytes)
    pub max_hot_bytes: u64,
    /// Hot blobs untouched for this long are cooled down
    pub cool_after_idle_secs: u64,
    /// Hot blobs smaller than this are never cooled for idleness
    pub min_cool_size: u64,
    /// Cold blobs read at least this often are warmed up; 0 disables warm-up
    pub warm_min_access_count: u64,
    /// Only accesses more recent than this count towards warm-up
    pub warm_access_window_secs: u64,
}

impl Default for TieringPolicy {
    fn default() -> Self {
        Self {
            max_hot_bytes: 10 * 1024 * 1024 * 1024,
            cool_after_idle_secs: 7 * 24 * 3600,
            min_cool_size: 0,
            warm_min_access_count: 3,
            warm_access_window_secs: 24 * 3600,
        }
    }
}

impl TieringPolicy {
    pub fn cool_after_idle(&self) -> Duration {
        Duration::from_secs(self.cool_after_idle_secs)
    }

    pub fn warm_access_window(&self) -> Duration {
        Duration::from_secs(self.warm_access_window_secs)
    }
}

/// Garbage collector knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Blobs written more recently than this are never orphan candidates
    pub min_orphan_age_secs: u64,
    /// Hot-tier usage (stored bytes) above which a pressure-gated run proceeds
    pub pressure_high_water_bytes: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_orphan_age_secs: 3600,
            pressure_high_water_bytes: 8 * 1024 * 1024 * 1024,
        }
    }
}

impl GcConfig {
    pub fn min_orphan_age(&self) -> Duration {
        Duration::from_secs(self.min_orphan_age_secs)
    }
}

/// Read-only SQLite reference oracle.
///
/// The queries are configurable so the engine does not impose a schema on the
/// metadata store. Both must return blob hashes (hex) in their first column;
/// the version query takes the version id as `?1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub path: PathBuf,
    #[serde(default = "default_live_query")]
    pub live_query: String,
    #[serde(default = "default_version_query")]
    pub version_query: String,
}

fn default_live_query() -> String {
    "SELECT DISTINCT blob_hash FROM dataset_version_blobs".to_string()
}

fn default_version_query() -> String {
    "SELECT blob_hash FROM dataset_version_blobs WHERE version_id = ?1".to_string()
}

impl OracleConfig {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            live_query: default_live_query(),
            version_query: default_version_query(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: StorageMode,
    /// Root of the hot tier (objects, trash, tmp)
    pub local_path: PathBuf,
    /// Blob index location; defaults to `{local_path}/index.sqlite`
    pub index_path: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    pub tiering: TieringPolicy,
    pub gc: GcConfig,
    /// Keep the cold copy after a warm-up
    pub retain_cold_on_warm_up: bool,
    pub oracle: Option<OracleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            local_path: PathBuf::from("data/blobs"),
            index_path: None,
            remote: RemoteConfig::default(),
            retry: RetryConfig::default(),
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
            tiering: TieringPolicy::default(),
            gc: GcConfig::default(),
            retain_cold_on_warm_up: true,
            oracle: None,
        }
    }
}

impl EngineConfig {
    /// Local-only configuration rooted at `path`
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: path.into(),
            ..Default::default()
        }
    }

    /// Hybrid configuration with the hot tier at `path`
    pub fn hybrid(path: impl Into<PathBuf>, remote: RemoteConfig) -> Self {
        Self {
            mode: StorageMode::Hybrid,
            local_path: path.into(),
            remote,
            ..Default::default()
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.local_path.join("index.sqlite"))
    }

    /// Reject inconsistent combinations before anything touches disk
    pub fn validate(&self) -> Result<()> {
        if self.local_path.as_os_str().is_empty() {
            return Err(StorageError::Configuration(
                "local_path must not be empty".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(StorageError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.compression.enabled && !(1..=22).contains(&self.compression.level) {
            return Err(StorageError::Configuration(format!(
                "compression.level must be within 1..=22, got {}",
                self.compression.level
            )));
        }
        if let RemoteConfig::S3 { bucket, endpoint, .. } = &self.remote {
            if bucket.is_empty() || endpoint.is_empty() {
                return Err(StorageError::Configuration(
                    "s3 remote requires endpoint and bucket".to_string(),
                ));
            }
        }
        if self.encryption.enabled && self.encryption.key_id.is_empty() {
            return Err(StorageError::Configuration(
                "encryption.key_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
