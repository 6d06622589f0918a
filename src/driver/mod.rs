//! Key-value adapter: one bin's view of a cluster connection.
//!
//! Adds bin-scoped key normalization, typed values, oversized value
//! splitting and optional per-operation statistics on top of a raw
//! [`Backend`]. Every failure below this layer is logged and reported as a
//! miss (`None`) or a failed write (`false`).

pub mod codec;
pub mod key;
pub mod pieces;

pub use codec::Serializer;
pub use key::{HashAlgorithm, KeyBuilder, MAX_KEY_LENGTH};
pub use pieces::{FragmentManifest, FragmentRecord, FragmentRegistry, REGISTRY_KEY};

use self::pieces::Payload;
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::observability::RequestStats;
use crate::storage::{Backend, ServerStats};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Stats fields that make no sense summed over servers
const NO_AGGREGATE: [&str; 7] = [
    "pid",
    "time",
    "version",
    "libevent",
    "pointer_size",
    "accepting_conns",
    "listen_disabled_num",
];

pub struct MemcacheDriver {
    bin: String,
    keys: KeyBuilder,
    backend: Arc<dyn Backend>,
    serializer: Serializer,
    item_max_size: usize,
    fragment_overhead: usize,
    log_fragment_count: usize,
    stats: Option<Arc<RequestStats>>,
    clock: SharedClock,
}

impl MemcacheDriver {
    pub fn new(
        bin: &str,
        backend: Arc<dyn Backend>,
        config: &CacheConfig,
        stats: Option<Arc<RequestStats>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            bin: bin.to_string(),
            keys: KeyBuilder::new(&config.key_prefix, bin, config.key_hash_algorithm),
            backend,
            serializer: config.serializer,
            item_max_size: config.item_max_size,
            fragment_overhead: config.fragment_overhead,
            log_fragment_count: config.log_fragment_count,
            stats,
            clock,
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// The cluster connection this bin shares with every other bin of the cluster
    pub fn connection(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Physical key for a logical key of this bin
    pub fn key(&self, key: &str) -> String {
        self.keys.key(key)
    }

    /// Start a timer only when statistics are collected
    fn stats_timer(&self) -> Option<Instant> {
        self.stats.as_ref().map(|_| Instant::now())
    }

    fn stats_write(&self, action: &str, started: Option<Instant>, keys: &[(String, bool)]) {
        if let (Some(stats), Some(started)) = (&self.stats, started) {
            stats.record(action, &self.bin, started, keys);
        }
    }

    /// Record a single logical key, building its physical key only when
    /// statistics are collected
    fn stats_write_key(&self, action: &str, started: Option<Instant>, key: &str, hit: bool) {
        if started.is_some() {
            self.stats_write(action, started, &[(self.key(key), hit)]);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = self.stats_timer();
        let full_key = self.key(key);
        let value = self
            .fetch(&full_key)
            .and_then(|payload| self.decode_payload(&full_key, payload));
        self.stats_write("get", started, &[(full_key, value.is_some())]);
        value
    }

    /// Raw bytes stored with [`MemcacheDriver::set_bytes`]
    pub fn get_bytes(&self, key: &str) -> Option<Bytes> {
        let started = self.stats_timer();
        let full_key = self.key(key);
        let value = match self.fetch(&full_key) {
            Some(Payload::Raw(bytes)) => Some(bytes),
            Some(_) => {
                debug!(key = %full_key, "stored value is not raw bytes");
                None
            }
            None => None,
        };
        self.stats_write("get", started, &[(full_key, value.is_some())]);
        value
    }

    /// Fetch several keys in one round trip. Only keys that were found and
    /// decoded are present in the result, keyed by logical key.
    pub fn get_multi<T, K>(&self, keys: &[K]) -> HashMap<String, T>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let started = self.stats_timer();
        let full_keys: Vec<String> = keys.iter().map(|k| self.key(k.as_ref())).collect();

        let mut raw = match self.backend.get_multi(&full_keys) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(bin = %self.bin, error = %e, "multi-get failed, treating as miss");
                HashMap::new()
            }
        };

        let mut results = HashMap::with_capacity(raw.len());
        let mut multi_stats = Vec::with_capacity(full_keys.len());
        // The store answers in any order; walk the request order instead.
        for (key, full_key) in keys.iter().zip(full_keys) {
            let value = raw
                .remove(&full_key)
                .and_then(|bytes| self.resolve(&full_key, bytes))
                .and_then(|payload| self.decode_payload::<T>(&full_key, payload));
            multi_stats.push((full_key, value.is_some()));
            if let Some(value) = value {
                results.insert(key.as_ref().to_string(), value);
            }
        }

        self.stats_write("getMulti", started, &multi_stats);
        results
    }

    /// Store a value, splitting it into pieces if the store rejects its size
    ///
    /// [`REGISTRY_KEY`] and the `_multi` piece keys are reserved.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, expire: u32) -> bool {
        let started = self.stats_timer();
        let result = match self.serializer.encode(value) {
            Ok(bytes) => self.store(key, Payload::Serialized(Bytes::from(bytes)), expire, true),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode value");
                false
            }
        };
        self.stats_write_key("set", started, key, result);
        result
    }

    pub fn set_bytes(&self, key: &str, value: Bytes, expire: u32) -> bool {
        let started = self.stats_timer();
        let result = self.store(key, Payload::Raw(value), expire, true);
        self.stats_write_key("set", started, key, result);
        result
    }

    /// Store only if the key does not exist yet. Never split.
    pub fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T, expire: u32) -> bool {
        let started = self.stats_timer();
        let full_key = self.key(key);
        let result = match self
            .serializer
            .encode(value)
            .and_then(|bytes| Payload::Serialized(Bytes::from(bytes)).encode(self.serializer))
        {
            Ok(bytes) => match self.backend.add(&full_key, bytes, expire) {
                Ok(added) => added,
                Err(e) => {
                    warn!(key = %full_key, error = %e, "add failed");
                    false
                }
            },
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode value");
                false
            }
        };
        self.stats_write("add", started, &[(full_key, result)]);
        result
    }

    /// Delete a key, together with the pieces of a split value
    pub fn delete(&self, key: &str) -> bool {
        let started = self.stats_timer();
        let full_key = self.key(key);

        if let Some(record) = self.fragment_registry().remove(&full_key) {
            self.delete_pieces(&record);
            self.registry_update(&full_key, None);
        }

        let result = match self.backend.delete(&full_key) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(key = %full_key, error = %e, "delete failed");
                false
            }
        };
        self.stats_write("delete", started, &[(full_key, result)]);
        result
    }

    /// Flush every server of the cluster
    pub fn flush(&self) -> bool {
        let started = self.stats_timer();
        let result = match self.backend.flush() {
            Ok(()) => true,
            Err(e) => {
                warn!(bin = %self.bin, error = %e, "flush failed");
                false
            }
        };
        self.stats_write("flush", started, &[(String::new(), result)]);
        result
    }

    /// Counters of every server in the cluster. With `aggregate`, numeric
    /// counters are also summed into a `total` row.
    pub fn stats(&self, aggregate: bool) -> ServerStats {
        let mut stats = match self.backend.stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(bin = %self.bin, error = %e, "stats failed");
                return ServerStats::new();
            }
        };
        if aggregate {
            let total = aggregate_stats(&stats);
            stats.insert("total".to_string(), total);
        }
        stats
    }

    /// Write `payload` under `key`. Oversized payloads are split when allowed.
    fn store(&self, key: &str, payload: Payload, expire: u32, allow_split: bool) -> bool {
        let full_key = self.key(key);
        let bytes = match payload.encode(self.serializer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %full_key, error = %e, "failed to encode payload");
                return false;
            }
        };

        match self.backend.set(&full_key, bytes, expire) {
            Ok(()) => true,
            Err(CacheError::ObjectTooLarge(_)) if allow_split => {
                self.pieces_set(key, payload, expire)
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "set failed");
                false
            }
        }
    }

    /// Read and unwrap whatever is stored under a physical key
    fn fetch(&self, full_key: &str) -> Option<Payload> {
        match self.backend.get(full_key) {
            Ok(Some(bytes)) => self.resolve(full_key, bytes),
            Ok(None) => None,
            Err(e) => {
                debug!(key = %full_key, error = %e, "get failed, treating as miss");
                None
            }
        }
    }

    /// Decode a stored envelope, reassembling split values
    fn resolve(&self, full_key: &str, bytes: Bytes) -> Option<Payload> {
        match Payload::decode(bytes, self.serializer) {
            Ok(Payload::Manifest(manifest)) => self.pieces_get(&manifest),
            Ok(Payload::Piece(_)) => None,
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(key = %full_key, error = %e, "undecodable item, treating as miss");
                None
            }
        }
    }

    fn decode_payload<T: DeserializeOwned>(&self, full_key: &str, payload: Payload) -> Option<T> {
        let Payload::Serialized(bytes) = payload else {
            debug!(key = %full_key, "stored value is raw bytes, not a serialized value");
            return None;
        };
        match self.serializer.decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %full_key, error = %e, "failed to decode value");
                None
            }
        }
    }
}

fn aggregate_stats(stats: &ServerStats) -> BTreeMap<String, String> {
    let mut integers: BTreeMap<String, u64> = BTreeMap::new();
    let mut floats: BTreeMap<String, f64> = BTreeMap::new();

    for row in stats.values() {
        for (name, value) in row {
            if NO_AGGREGATE.contains(&name.as_str()) {
                continue;
            }
            if let Ok(n) = value.parse::<u64>() {
                *integers.entry(name.clone()).or_default() += n;
            } else if let Ok(f) = value.parse::<f64>() {
                *floats.entry(name.clone()).or_default() += f;
            }
        }
    }

    let mut total: BTreeMap<String, String> = integers
        .into_iter()
        .map(|(name, n)| (name, n.to_string()))
        .collect();
    for (name, f) in floats {
        total.entry(name).or_insert_with(|| format!("{:.6}", f));
    }
    total
}
