pub mod cache;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod observability;
pub mod storage;
pub mod tags;

pub use cache::{CacheBackend, CacheBackendFactory, CacheEntry, Expire, NewEntry};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use cluster::ClusterRouter;
pub use config::{CacheConfig, Settings};
pub use driver::{MemcacheDriver, Serializer};
pub use error::{CacheError, Result};
pub use storage::{Backend, Connector, DriverKind};
