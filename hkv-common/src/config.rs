//! Configuration schema, loading, and validation.
//!
//! Mirrors `kvstore/config.py` and `kvstore/core/config.py` from the original
//! implementation, flattened into one typed tree instead of a base config
//! plus a server subclass with backward-compatibility property shims.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HkvError, HkvResult};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
    Lmdb,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Memory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    Always,
    Everysec,
    No,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Everysec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Arc,
    Random,
    VolatileLru,
    VolatileLfu,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockType {
    Vector,
    Hlc,
    Lamport,
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::Hlc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementStrategy {
    NumaAware,
    LoadBalanced,
    LocalityAware,
    RoundRobin,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        PlacementStrategy::NumaAware
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
    pub tls_enabled: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6379,
            max_connections: 10_000,
            tls_enabled: false,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub backend: StorageBackend,
    pub aof_enabled: bool,
    pub aof_fsync_policy: FsyncPolicy,
    pub snapshot_enabled: bool,
    pub snapshot_interval_secs: u64,
    pub snapshot_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/hyperkv".to_string(),
            backend: StorageBackend::Memory,
            aof_enabled: true,
            aof_fsync_policy: FsyncPolicy::Everysec,
            snapshot_enabled: true,
            snapshot_interval_secs: 300,
            snapshot_compression: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub max_memory: u64,
    pub eviction_policy: EvictionPolicy,
    pub eviction_batch_size: u32,
    pub memory_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory: 1024 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            eviction_batch_size: 100,
            memory_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CrdtConfig {
    pub clock_type: ClockType,
    pub tombstone_gc_interval_secs: Option<u64>,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self { clock_type: ClockType::Hlc, tombstone_gc_interval_secs: Some(3600) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PubSubConfig {
    pub max_channels: u32,
    pub max_subscribers_per_channel: u32,
    pub message_buffer_size: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            max_channels: 100_000,
            max_subscribers_per_channel: 1_000,
            message_buffer_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecurityConfig {
    pub require_auth: bool,
    pub auth_password: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { require_auth: false, auth_password: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShardingConfig {
    pub num_shards: u32,
    pub placement_strategy: PlacementStrategy,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self { num_shards: 16, placement_strategy: PlacementStrategy::NumaAware }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub node_id: String,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub crdt: CrdtConfig,
    pub pubsub: PubSubConfig,
    pub security: SecurityConfig,
    pub sharding: ShardingConfig,
    pub worker_threads: usize,
    pub background_task_failure_threshold: u32,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "hyperkv-node-1".to_string(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            crdt: CrdtConfig::default(),
            pubsub: PubSubConfig::default(),
            security: SecurityConfig::default(),
            sharding: ShardingConfig::default(),
            worker_threads: 4,
            background_task_failure_threshold: 5,
            enable_metrics: true,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load from a TOML file. A missing file yields defaults, matching the
    /// original implementation's `from_file` behavior.
    pub fn from_file(path: impl AsRef<Path>) -> HkvResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| HkvError::invalid_argument(format!("invalid config file: {e}")))
    }

    /// Overlay `HYPERKV_*` environment variables onto an already-loaded
    /// config. Mirrors `HYPERKV_WORKER_THREADS`, `HYPERKV_NODE_ID`, etc. from
    /// the original implementation's `from_env`.
    pub fn apply_env_overrides(mut self) -> HkvResult<Self> {
        if let Ok(v) = std::env::var("HYPERKV_NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = std::env::var("HYPERKV_HOST") {
            self.network.host = v;
        }
        if let Ok(v) = std::env::var("HYPERKV_PORT") {
            self.network.port = v
                .parse()
                .map_err(|_| HkvError::invalid_argument("HYPERKV_PORT must be a u16"))?;
        }
        if let Ok(v) = std::env::var("HYPERKV_DATA_DIR") {
            self.storage.data_dir = v;
        }
        if let Ok(v) = std::env::var("HYPERKV_WORKER_THREADS") {
            self.worker_threads = v
                .parse()
                .map_err(|_| HkvError::invalid_argument("HYPERKV_WORKER_THREADS must be a usize"))?;
        }
        if let Ok(v) = std::env::var("HYPERKV_NUM_SHARDS") {
            self.sharding.num_shards = v
                .parse()
                .map_err(|_| HkvError::invalid_argument("HYPERKV_NUM_SHARDS must be a u32"))?;
        }
        Ok(self)
    }

    /// Cross-field validation beyond what `deny_unknown_fields` catches.
    pub fn validate(&self) -> HkvResult<()> {
        let mut errors = Vec::new();

        if self.network.tls_enabled {
            if self.network.tls_cert_file.is_none() {
                errors.push("tls_cert_file is required when TLS is enabled".to_string());
            }
            if self.network.tls_key_file.is_none() {
                errors.push("tls_key_file is required when TLS is enabled".to_string());
            }
        }

        if self.security.require_auth && self.security.auth_password.is_none() {
            errors.push("auth_password is required when authentication is enabled".to_string());
        }

        if self.sharding.num_shards == 0 {
            errors.push("num_shards must be positive".to_string());
        }

        if self.cache.eviction_batch_size < 1 {
            errors.push("eviction_batch_size must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.cache.memory_threshold) {
            errors.push("cache.memory_threshold must be within [0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HkvError::invalid_argument(errors.join("; ")))
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.storage.snapshot_interval_secs)
    }

    pub fn tombstone_gc_interval(&self) -> Option<Duration> {
        self.crdt.tombstone_gc_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tls_without_cert_fails_validation() {
        let mut cfg = Config::default();
        cfg.network.tls_enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, HkvError::InvalidArgument(_)));
    }

    #[test]
    fn auth_without_password_fails_validation() {
        let mut cfg = Config::default();
        cfg.security.require_auth = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_shards_fails_validation() {
        let mut cfg = Config::default();
        cfg.sharding.num_shards = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::from_file("/nonexistent/path/hyperkv.toml").unwrap();
        assert_eq!(cfg.node_id, Config::default().node_id);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let toml_text = "node_id = \"n1\"\nbogus_field = 1\n";
        let result: Result<Config, _> = toml::from_str(toml_text);
        assert!(result.is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.node_id, cfg.node_id);
        assert_eq!(parsed.sharding.num_shards, cfg.sharding.num_shards);
    }
}
