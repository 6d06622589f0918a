//! Values larger than one store item.
//!
//! A value the store rejects for its size is written as a manifest under its
//! own key plus numbered pieces under derived keys. Reads reassemble the
//! pieces and report a miss if any one of them is gone.
//!
//! Root keys that currently own pieces are tracked in a registry item so a
//! delete, or a later sweep, can remove the pieces too. The registry is a
//! plain item and may be evicted or outgrow the store; pieces then simply
//! age out with the expiration they were written with.

use super::MemcacheDriver;
use crate::error::{CacheError, Result};
use crate::storage::RELATIVE_EXPIRE_LIMIT;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Logical key of the registry item in every bin
pub const REGISTRY_KEY: &str = "__fragment_registry";

/// Registry entries written without an expiration are kept this long
const REGISTRY_DEFAULT_TTL: i64 = RELATIVE_EXPIRE_LIMIT as i64;

const TAG_RAW: u8 = b'R';
const TAG_SERIALIZED: u8 = b'S';
const TAG_MANIFEST: u8 = b'M';
const TAG_PIECE: u8 = b'P';

/// Placeholder stored under the root key of a split value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentManifest {
    /// Logical key the pieces are derived from
    pub root_key: String,
    /// Whether the reassembled bytes are a codec-encoded value
    pub serialized: bool,
    pub piece_count: usize,
}

/// Registry entry for one root key owning pieces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub root_key: String,
    pub piece_count: usize,
    /// UNIX seconds after which the pieces are expected to be gone
    pub expire: i64,
}

pub type FragmentRegistry = BTreeMap<String, FragmentRecord>;

/// What a single store item holds. The first byte of the item says which.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Raw(Bytes),
    Serialized(Bytes),
    Manifest(FragmentManifest),
    Piece(Bytes),
}

impl Payload {
    pub(crate) fn encode(&self, serializer: super::Serializer) -> Result<Bytes> {
        let (tag, body): (u8, Bytes) = match self {
            Payload::Raw(data) => (TAG_RAW, data.clone()),
            Payload::Serialized(data) => (TAG_SERIALIZED, data.clone()),
            Payload::Manifest(manifest) => (TAG_MANIFEST, Bytes::from(serializer.encode(manifest)?)),
            Payload::Piece(data) => (TAG_PIECE, data.clone()),
        };
        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_u8(tag);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    pub(crate) fn decode(mut bytes: Bytes, serializer: super::Serializer) -> Result<Self> {
        if bytes.is_empty() {
            return Err(CacheError::Codec("empty item".to_string()));
        }
        let tag = bytes[0];
        let body = bytes.split_off(1);
        match tag {
            TAG_RAW => Ok(Payload::Raw(body)),
            TAG_SERIALIZED => Ok(Payload::Serialized(body)),
            TAG_MANIFEST => Ok(Payload::Manifest(serializer.decode(&body)?)),
            TAG_PIECE => Ok(Payload::Piece(body)),
            other => Err(CacheError::Codec(format!("unknown item tag 0x{:02x}", other))),
        }
    }
}

impl MemcacheDriver {
    /// Logical key of piece `id` of `key`
    pub fn piece_key(key: &str, id: usize) -> String {
        format!("_multi{}-{}", id, key)
    }

    /// Largest piece that fits next to `full_key` and the item overhead
    pub fn piece_size(&self, full_key: &str) -> usize {
        self.item_max_size
            .saturating_sub(self.fragment_overhead + full_key.len())
            .max(1)
    }

    /// Split `payload` and store it as a manifest plus pieces. True only if
    /// every write succeeded.
    pub(crate) fn pieces_set(&self, key: &str, payload: Payload, expire: u32) -> bool {
        let (serialized, data) = match payload {
            Payload::Raw(data) => (false, data),
            Payload::Serialized(data) => (true, data),
            Payload::Manifest(_) | Payload::Piece(_) => return false,
        };
        let started = Instant::now();
        let full_key = self.key(key);
        let piece_size = self.piece_size(&full_key);
        let piece_count = data.len().div_ceil(piece_size).max(1);

        let record = FragmentRecord {
            root_key: key.to_string(),
            piece_count,
            expire: self.registry_expire(expire),
        };
        if !self.registry_update(&full_key, Some(record)) {
            warn!(
                bin = %self.bin,
                "fragment registry could not be written, pieces of oversized items \
                 are left to expire on their own"
            );
        }

        let manifest = Payload::Manifest(FragmentManifest {
            root_key: key.to_string(),
            serialized,
            piece_count,
        });
        let mut result = self.store(key, manifest, expire, false);

        for id in 0..piece_count {
            let start = id * piece_size;
            let end = (start + piece_size).min(data.len());
            let piece = Payload::Piece(data.slice(start..end));
            result &= self.store(&Self::piece_key(key, id), piece, expire, false);
        }

        if self.log_fragment_count > 0 && piece_count >= self.log_fragment_count {
            warn!(
                key = %full_key,
                bytes = data.len(),
                pieces = piece_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "split oversized item into pieces"
            );
        }
        result
    }

    /// Reassemble a split value. Any missing piece makes the whole value a miss.
    pub(crate) fn pieces_get(&self, manifest: &FragmentManifest) -> Option<Payload> {
        let keys: Vec<String> = (0..manifest.piece_count)
            .map(|id| self.key(&Self::piece_key(&manifest.root_key, id)))
            .collect();

        let mut found = match self.backend.get_multi(&keys) {
            Ok(found) => found,
            Err(e) => {
                debug!(key = %manifest.root_key, error = %e, "failed to fetch pieces");
                return None;
            }
        };

        let mut data = BytesMut::new();
        for key in &keys {
            let piece = found
                .remove(key)
                .and_then(|bytes| Payload::decode(bytes, self.serializer).ok());
            match piece {
                Some(Payload::Piece(bytes)) => data.extend_from_slice(&bytes),
                _ => {
                    debug!(key = %key, root = %manifest.root_key, "missing piece, treating as miss");
                    return None;
                }
            }
        }

        let data = data.freeze();
        Some(if manifest.serialized {
            Payload::Serialized(data)
        } else {
            Payload::Raw(data)
        })
    }

    /// Delete every piece of a registered root key
    pub(crate) fn delete_pieces(&self, record: &FragmentRecord) {
        for id in 0..record.piece_count {
            let piece_key = self.key(&Self::piece_key(&record.root_key, id));
            if let Err(e) = self.backend.delete(&piece_key) {
                debug!(key = %piece_key, error = %e, "failed to delete piece");
            }
        }
    }

    /// Current registry content. A missing or unreadable registry is empty.
    pub fn fragment_registry(&self) -> FragmentRegistry {
        match self.fetch(&self.key(REGISTRY_KEY)) {
            Some(Payload::Serialized(bytes)) => self.serializer.decode(&bytes).unwrap_or_default(),
            _ => FragmentRegistry::new(),
        }
    }

    /// Add (`Some`) or remove (`None`) a root key. The registry item itself
    /// is never split.
    pub(crate) fn registry_update(&self, full_key: &str, record: Option<FragmentRecord>) -> bool {
        let mut registry = self.fragment_registry();
        match record {
            Some(record) => {
                registry.insert(full_key.to_string(), record);
            }
            None => {
                if registry.remove(full_key).is_none() {
                    return true;
                }
            }
        }
        self.write_registry(&registry)
    }

    fn write_registry(&self, registry: &FragmentRegistry) -> bool {
        match self.serializer.encode(registry) {
            Ok(bytes) => self.store(REGISTRY_KEY, Payload::Serialized(Bytes::from(bytes)), 0, false),
            Err(e) => {
                warn!(bin = %self.bin, error = %e, "failed to encode fragment registry");
                false
            }
        }
    }

    /// Absolute expiry in UNIX seconds for a registry entry
    fn registry_expire(&self, expire: u32) -> i64 {
        let now = self.clock.now_secs();
        match expire {
            0 => now + REGISTRY_DEFAULT_TTL,
            secs if secs <= RELATIVE_EXPIRE_LIMIT => now + i64::from(secs),
            timestamp => i64::from(timestamp),
        }
    }

    /// Delete the pieces of every registered root key whose expiry has
    /// passed and drop them from the registry. Returns how many root keys
    /// were swept.
    pub fn sweep_fragments(&self) -> usize {
        let now = self.clock.now_secs();
        let mut registry = self.fragment_registry();
        let expired: Vec<String> = registry
            .iter()
            .filter(|(_, record)| record.expire <= now)
            .map(|(full_key, _)| full_key.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for full_key in &expired {
            if let Some(record) = registry.remove(full_key) {
                self.delete_pieces(&record);
            }
        }
        if !self.write_registry(&registry) {
            warn!(bin = %self.bin, "failed to write fragment registry after sweep");
        }
        debug!(bin = %self.bin, swept = expired.len(), "swept expired fragments");
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::driver::Serializer;
    use crate::storage::{Backend, MemoryBackend};
    use std::sync::Arc;

    const LIMIT: usize = 4096;

    fn setup(clock: &ManualClock) -> (MemoryBackend, MemcacheDriver) {
        let backend = MemoryBackend::new(LIMIT);
        backend.add_server("127.0.0.1:11211", false).unwrap();
        let config = CacheConfig {
            item_max_size: LIMIT,
            ..Default::default()
        };
        let driver = MemcacheDriver::new(
            "cache",
            Arc::new(backend.clone()),
            &config,
            None,
            Arc::new(clock.clone()),
        );
        (backend, driver)
    }

    #[test]
    fn test_payload_envelope() {
        let manifest = Payload::Manifest(FragmentManifest {
            root_key: "k".to_string(),
            serialized: true,
            piece_count: 3,
        });
        for payload in [
            Payload::Raw(Bytes::from_static(b"abc")),
            Payload::Serialized(Bytes::from_static(b"")),
            Payload::Piece(Bytes::from_static(b"\x00\xff")),
            manifest,
        ] {
            let bytes = payload.encode(Serializer::Json).unwrap();
            assert_eq!(Payload::decode(bytes, Serializer::Json).unwrap(), payload);
        }
        assert!(Payload::decode(Bytes::new(), Serializer::Json).is_err());
        assert!(Payload::decode(Bytes::from_static(b"Xabc"), Serializer::Json).is_err());
    }

    #[test]
    fn test_large_raw_value_is_split_and_registered() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (backend, driver) = setup(&clock);
        let data: Vec<u8> = (0..LIMIT * 3).map(|i| (i % 251) as u8).collect();

        assert!(driver.set_bytes("big", Bytes::from(data.clone()), 0));
        assert_eq!(driver.get_bytes("big"), Some(Bytes::from(data)));

        let full_key = driver.key("big");
        let registry = driver.fragment_registry();
        let record = &registry[&full_key];
        assert!(record.piece_count >= 3);
        assert_eq!(record.expire, 1_700_000_000 + REGISTRY_DEFAULT_TTL);
        assert!(backend.keys().contains(&driver.key("_multi0-big")));
    }

    #[test]
    fn test_missing_piece_is_a_miss() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (backend, driver) = setup(&clock);
        let value = "x".repeat(LIMIT * 2);
        assert!(driver.set("big", &value, 0));

        backend.delete(&driver.key("_multi1-big")).unwrap();
        assert_eq!(driver.get::<String>("big"), None);
    }

    #[test]
    fn test_delete_removes_pieces() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (backend, driver) = setup(&clock);
        assert!(driver.set("big", &"y".repeat(LIMIT * 2), 0));

        assert!(driver.delete("big"));
        let keys = backend.keys();
        assert!(!keys.iter().any(|k| k.contains("_multi")));
        assert!(driver.fragment_registry().is_empty());
    }

    #[test]
    fn test_sweep_only_expired_roots() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (backend, driver) = setup(&clock);
        assert!(driver.set("short", &"a".repeat(LIMIT * 2), 60));
        assert!(driver.set("long", &"b".repeat(LIMIT * 2), 3600));

        assert_eq!(driver.sweep_fragments(), 0);
        clock.advance(120_000);
        assert_eq!(driver.sweep_fragments(), 1);

        let registry = driver.fragment_registry();
        assert!(registry.contains_key(&driver.key("long")));
        assert!(!registry.contains_key(&driver.key("short")));
        assert!(!backend.keys().contains(&driver.key("_multi0-short")));
    }

    #[test]
    fn test_registry_overflow_keeps_split_writes() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (backend, driver) = setup(&clock);
        let padding = "x".repeat(200);
        let keys: Vec<String> = (0..20).map(|i| format!("big-{}-{}", i, padding)).collect();

        for (i, key) in keys.iter().enumerate() {
            let value = format!("{}", i).repeat(LIMIT * 2);
            assert!(driver.set(key, &value, 0), "key {}", i);
        }
        for (i, key) in keys.iter().enumerate() {
            let value = format!("{}", i).repeat(LIMIT * 2);
            assert_eq!(driver.get::<String>(key), Some(value), "key {}", i);
        }

        // The registry stopped growing once it no longer fit in one item
        let registry = driver.fragment_registry();
        assert!(!registry.is_empty());
        assert!(registry.len() < keys.len());

        let stored = backend.get(&driver.key(REGISTRY_KEY)).unwrap().unwrap();
        assert_eq!(stored[0], TAG_SERIALIZED);
        assert!(!backend
            .keys()
            .iter()
            .any(|k| k.contains(&format!("_multi0-{}", REGISTRY_KEY))));
    }

    #[test]
    fn test_piece_size_accounts_for_key() {
        let clock = ManualClock::new(0);
        let (_backend, driver) = setup(&clock);
        assert_eq!(driver.piece_size("abcd"), LIMIT - 512 - 4);
    }

    #[test]
    fn test_pieces_are_never_split_again() {
        let clock = ManualClock::new(0);
        let (_backend, driver) = setup(&clock);
        let piece = Payload::Piece(Bytes::from(vec![0u8; LIMIT * 2]));
        assert!(!driver.pieces_set("p", piece, 0));
    }
}
