//! Raw key/value store drivers.
//!
//! A `Backend` is one connection object for one cluster: servers are added
//! to it in configured order and it is shared, behind an `Arc`, by every bin
//! mapped to that cluster. Closing it is therefore visible to all of them.

pub mod hashring;
pub mod memcached;
pub mod memory;
pub mod protocol;

pub use memcached::MemcachedBackend;
pub use memory::MemoryBackend;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Counters reported by each server, keyed by server address
pub type ServerStats = BTreeMap<String, BTreeMap<String, String>>;

/// Relative expiration times above this many seconds are absolute UNIX times
pub const RELATIVE_EXPIRE_LIMIT: u32 = 60 * 60 * 24 * 30;

/// The primitive store: flat get/set/delete, no transactions, no tags
pub trait Backend: Send + Sync {
    /// Connect a server to this connection object
    fn add_server(&self, address: &str, persistent: bool) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Fetch several keys at once. Missing keys are simply absent from the
    /// result and no ordering is implied.
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Bytes>>;

    /// Store unconditionally. `exptime` follows memcached: 0 never expires,
    /// up to 30 days is relative seconds, anything larger is a UNIX time.
    fn set(&self, key: &str, value: Bytes, exptime: u32) -> Result<()>;

    /// Store only if the key does not exist yet
    fn add(&self, key: &str, value: Bytes, exptime: u32) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn flush(&self) -> Result<()>;

    fn stats(&self) -> Result<ServerStats>;

    /// Drop every server connection
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Backend driver variants available in this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process store, for tests and single-process deployments
    Memory,
    /// memcached ASCII protocol over TCP or UNIX sockets
    #[default]
    Memcached,
}

impl FromStr for DriverKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "memcached" | "memcache" => Ok(DriverKind::Memcached),
            other => Err(CacheError::DriverUnavailable(format!(
                "unknown backend driver '{}' (available: memory, memcached)",
                other
            ))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Memory => write!(f, "memory"),
            DriverKind::Memcached => write!(f, "memcached"),
        }
    }
}

type BackendFactory = dyn Fn() -> Arc<dyn Backend> + Send + Sync;

/// Creates fresh, unconnected backend objects
#[derive(Clone)]
pub enum Connector {
    Driver {
        kind: DriverKind,
        item_max_size: usize,
        connect_timeout: Duration,
        io_timeout: Duration,
    },
    Custom(Arc<BackendFactory>),
}

impl Connector {
    pub fn from_config(config: &CacheConfig) -> Self {
        Connector::Driver {
            kind: config.driver,
            item_max_size: config.item_max_size,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        }
    }

    /// Use a caller supplied factory instead of a built-in driver
    pub fn custom<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
    {
        Connector::Custom(Arc::new(factory))
    }

    pub fn open(&self) -> Arc<dyn Backend> {
        match self {
            Connector::Driver {
                kind: DriverKind::Memory,
                item_max_size,
                ..
            } => Arc::new(MemoryBackend::new(*item_max_size)),
            Connector::Driver {
                kind: DriverKind::Memcached,
                item_max_size,
                connect_timeout,
                io_timeout,
            } => Arc::new(MemcachedBackend::new(
                *connect_timeout,
                *io_timeout,
                *item_max_size,
            )),
            Connector::Custom(factory) => factory(),
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::Driver { kind, .. } => write!(f, "Connector::Driver({})", kind),
            Connector::Custom(_) => write!(f, "Connector::Custom"),
        }
    }
}
