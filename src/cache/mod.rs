//! Tagged, bin-flushable cache entries.

pub mod backend;
pub mod entry;
pub mod factory;

pub use backend::CacheBackend;
pub use entry::{CacheEntry, EntryRecord, Expire, NewEntry};
pub use factory::CacheBackendFactory;
