use super::{Backend, ServerStats, RELATIVE_EXPIRE_LIMIT};
use crate::error::{CacheError, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Value with optional expiration time
#[derive(Clone, Debug)]
struct StoredItem {
    value: Bytes,
    /// Expiration time in milliseconds since UNIX epoch
    expires_at: Option<u64>,
}

impl StoredItem {
    fn new(value: Bytes, exptime: u32) -> Self {
        let expires_at = match exptime {
            0 => None,
            secs if secs <= RELATIVE_EXPIRE_LIMIT => {
                Some(current_time_ms() + u64::from(secs) * 1000)
            }
            timestamp => Some(u64::from(timestamp) * 1000),
        };
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => current_time_ms() >= expires_at,
            None => false,
        }
    }
}

/// Get current time in milliseconds
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct Counters {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
}

/// In-process store with memcached item semantics.
///
/// Enforces the per-item size ceiling the same way a memcached server does,
/// so oversized values exercise the split path. Addresses registered with
/// [`MemoryBackend::refusing`] fail to connect, and [`MemoryBackend::set_down`]
/// simulates an outage of an already connected store.
#[derive(Clone)]
pub struct MemoryBackend {
    items: Arc<RwLock<HashMap<String, StoredItem>>>,
    servers: Arc<RwLock<Vec<String>>>,
    refused: Arc<HashSet<String>>,
    item_max_size: usize,
    closed: Arc<AtomicBool>,
    down: Arc<AtomicBool>,
    counters: Arc<Counters>,
    started: u64,
}

impl MemoryBackend {
    pub fn new(item_max_size: usize) -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            servers: Arc::new(RwLock::new(Vec::new())),
            refused: Arc::new(HashSet::new()),
            item_max_size,
            closed: Arc::new(AtomicBool::new(false)),
            down: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            started: current_time_ms(),
        }
    }

    /// Refuse connections to the given addresses
    pub fn refusing<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refused = Arc::new(addresses.into_iter().map(Into::into).collect());
        self
    }

    /// Make every operation fail as if the servers stopped answering
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of live items
    pub fn len(&self) -> usize {
        self.items
            .read()
            .map(|items| items.values().filter(|v| !v.is_expired()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.items
            .read()
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, v)| !v.is_expired())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers
            .read()
            .map(|servers| servers.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "memory backend is down",
            )));
        }
        let has_servers = self.servers.read().map(|s| !s.is_empty()).unwrap_or(false);
        if !has_servers {
            return Err(CacheError::Backend("no servers connected".to_string()));
        }
        Ok(())
    }

    fn check_size(&self, key: &str, value: &Bytes) -> Result<()> {
        if key.len() + value.len() > self.item_max_size {
            return Err(CacheError::ObjectTooLarge(
                "SERVER_ERROR object too large for cache".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> CacheError {
        CacheError::Backend(format!("Lock error: {}", e))
    }
}

impl Backend for MemoryBackend {
    fn add_server(&self, address: &str, _persistent: bool) -> Result<()> {
        if self.refused.contains(address) {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection to {} refused", address),
            )));
        }
        let mut servers = self.servers.write().map_err(Self::lock_error)?;
        if !servers.iter().any(|s| s == address) {
            servers.push(address.to_string());
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);
        let items = self.items.read().map_err(Self::lock_error)?;

        match items.get(key) {
            Some(item) if !item.is_expired() => {
                self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item.value.clone()))
            }
            _ => {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        self.check_available()?;
        let items = self.items.read().map_err(Self::lock_error)?;
        let mut found = HashMap::with_capacity(keys.len());

        for key in keys {
            self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);
            match items.get(key) {
                Some(item) if !item.is_expired() => {
                    self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), item.value.clone());
                }
                _ => {
                    self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(found)
    }

    fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<()> {
        self.check_available()?;
        self.check_size(key, &value)?;
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.write().map_err(Self::lock_error)?;
        items.insert(key.to_string(), StoredItem::new(value, exptime));
        Ok(())
    }

    fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool> {
        self.check_available()?;
        self.check_size(key, &value)?;
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.write().map_err(Self::lock_error)?;

        if let Some(existing) = items.get(key) {
            if !existing.is_expired() {
                return Ok(false);
            }
        }
        items.insert(key.to_string(), StoredItem::new(value, exptime));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut items = self.items.write().map_err(Self::lock_error)?;
        let deleted = matches!(items.remove(key), Some(item) if !item.is_expired());
        if deleted {
            self.counters.delete_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.delete_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(deleted)
    }

    fn flush(&self) -> Result<()> {
        self.check_available()?;
        let mut items = self.items.write().map_err(Self::lock_error)?;
        items.clear();
        Ok(())
    }

    fn stats(&self) -> Result<ServerStats> {
        self.check_available()?;
        let (curr_items, bytes) = {
            let items = self.items.read().map_err(Self::lock_error)?;
            items
                .iter()
                .filter(|(_, v)| !v.is_expired())
                .fold((0u64, 0u64), |(n, b), (k, v)| {
                    (n + 1, b + (k.len() + v.value.len()) as u64)
                })
        };
        let uptime = (current_time_ms().saturating_sub(self.started) / 1000).to_string();
        let c = &self.counters;

        let mut stats = ServerStats::new();
        for server in self.servers() {
            let mut row = BTreeMap::new();
            row.insert("pid".to_string(), std::process::id().to_string());
            row.insert("uptime".to_string(), uptime.clone());
            row.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
            row.insert("curr_items".to_string(), curr_items.to_string());
            row.insert("bytes".to_string(), bytes.to_string());
            row.insert("limit_maxbytes".to_string(), "0".to_string());
            row.insert("item_size_max".to_string(), self.item_max_size.to_string());
            row.insert("evictions".to_string(), "0".to_string());
            row.insert("curr_connections".to_string(), "1".to_string());
            for (name, counter) in [
                ("cmd_get", &c.cmd_get),
                ("cmd_set", &c.cmd_set),
                ("get_hits", &c.get_hits),
                ("get_misses", &c.get_misses),
                ("delete_hits", &c.delete_hits),
                ("delete_misses", &c.delete_misses),
            ] {
                row.insert(name.to_string(), counter.load(Ordering::Relaxed).to_string());
            }
            stats.insert(server, row);
        }
        Ok(stats)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
