//! Static configuration: clusters, bin mapping and driver tuning.
//!
//! Loaded once from TOML. Every option has a default so an empty file
//! describes a single local memcached serving every bin.

use crate::driver::{HashAlgorithm, Serializer, MAX_KEY_LENGTH};
use crate::error::{CacheError, Result};
use crate::observability::LogSettings;
use crate::storage::DriverKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Cluster every unmapped bin falls back to when the default bin is unmapped too
pub const DEFAULT_CLUSTER: &str = "default";

/// Configuration of the cache layer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cluster name -> server addresses, in connection order
    pub clusters: BTreeMap<String, Vec<String>>,
    /// Bin name -> cluster name
    pub bins: BTreeMap<String, String>,
    /// Bin whose cluster serves every unmapped bin
    pub default_bin: String,
    /// Bin holding tag invalidation timestamps
    pub invalidation_bin: String,
    /// Backend driver variant
    pub driver: DriverKind,
    /// Keep connections open and reconnect after I/O failures
    pub persistent: bool,
    /// Codec for entries and split values
    pub serializer: Serializer,
    /// Digest used to shorten keys longer than the store allows
    pub key_hash_algorithm: HashAlgorithm,
    /// Prefix prepended to every physical key
    pub key_prefix: String,
    /// Largest single item the store accepts, in bytes
    pub item_max_size: usize,
    /// Bytes reserved per piece for metadata (the key length is added on top)
    pub fragment_overhead: usize,
    /// Clock skew tolerance applied against bin deletion markers
    pub bin_deletion_skew_ms: i64,
    /// Warn when a value is split into at least this many pieces (0 = never)
    pub log_fragment_count: usize,
    /// Collect per-operation statistics
    pub stats: bool,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(
            DEFAULT_CLUSTER.to_string(),
            vec!["127.0.0.1:11211".to_string()],
        );
        let mut bins = BTreeMap::new();
        bins.insert("cache".to_string(), DEFAULT_CLUSTER.to_string());

        Self {
            clusters,
            bins,
            default_bin: "cache".to_string(),
            invalidation_bin: "memcache_invalidation_timestamps".to_string(),
            driver: DriverKind::default(),
            persistent: false,
            serializer: Serializer::default(),
            key_hash_algorithm: HashAlgorithm::default(),
            key_prefix: String::new(),
            item_max_size: 1024 * 1024,
            fragment_overhead: 512,
            bin_deletion_skew_ms: 1,
            log_fragment_count: 2,
            stats: false,
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheConfig =
            toml::from_str(content).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the numeric options against each other
    pub fn validate(&self) -> Result<()> {
        if self.item_max_size <= self.fragment_overhead + MAX_KEY_LENGTH {
            return Err(CacheError::Config(format!(
                "item_max_size ({}) must exceed fragment_overhead ({}) plus the maximum key length ({})",
                self.item_max_size, self.fragment_overhead, MAX_KEY_LENGTH
            )));
        }
        if self.bin_deletion_skew_ms < 0 {
            return Err(CacheError::Config(
                "bin_deletion_skew_ms must not be negative".to_string(),
            ));
        }
        if self.default_bin.is_empty() {
            return Err(CacheError::Config("default_bin must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolve the cluster serving a bin
    ///
    /// Unmapped bins share the cluster of the default bin.
    pub fn cluster_for(&self, bin: &str) -> &str {
        self.bins
            .get(bin)
            .or_else(|| self.bins.get(&self.default_bin))
            .map(String::as_str)
            .unwrap_or(DEFAULT_CLUSTER)
    }

    /// Server addresses of a cluster in configured order
    pub fn servers_for(&self, cluster: &str) -> &[String] {
        self.clusters
            .get(cluster)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Root of the configuration file: `[cache]` and `[logging]` sections
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LogSettings,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| CacheError::Config(e.to_string()))?;
        settings.cache.validate()?;
        Ok(settings)
    }

    /// Read and parse a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}
