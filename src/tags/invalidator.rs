use crate::clock::SharedClock;
use crate::driver::MemcacheDriver;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Records the last invalidation time of each tag, in milliseconds, as one
/// item per tag in the invalidation bin.
pub struct TimestampInvalidator {
    driver: Arc<MemcacheDriver>,
    clock: SharedClock,
}

impl TimestampInvalidator {
    pub fn new(driver: Arc<MemcacheDriver>, clock: SharedClock) -> Self {
        Self { driver, clock }
    }

    pub fn bin(&self) -> &str {
        self.driver.bin()
    }

    /// Mark `tag` invalidated now and return the recorded timestamp.
    ///
    /// The timestamp is strictly greater than the one it replaces, even if
    /// the wall clock has not moved or went backwards.
    pub fn invalidate_timestamp(&self, tag: &str) -> i64 {
        let now = self.clock.now_ms();
        let timestamp = match self.last_timestamp(tag) {
            Some(previous) => now.max(previous + 1),
            None => now,
        };
        if !self.driver.set(tag, &timestamp, 0) {
            warn!(tag = %tag, "failed to record tag invalidation");
        }
        timestamp
    }

    pub fn last_timestamp(&self, tag: &str) -> Option<i64> {
        self.driver.get(tag)
    }

    /// Recorded timestamps of `tags`. Tags without a record are absent.
    pub fn last_timestamps<S: AsRef<str>>(&self, tags: &[S]) -> HashMap<String, i64> {
        self.driver.get_multi(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::storage::{Backend, MemoryBackend};

    fn invalidator(clock: &ManualClock) -> (MemoryBackend, TimestampInvalidator) {
        let backend = MemoryBackend::new(1024 * 1024);
        backend.add_server("127.0.0.1:11211", false).unwrap();
        let clock: SharedClock = Arc::new(clock.clone());
        let driver = MemcacheDriver::new(
            "memcache_invalidation_timestamps",
            Arc::new(backend.clone()),
            &CacheConfig::default(),
            None,
            clock.clone(),
        );
        (backend, TimestampInvalidator::new(Arc::new(driver), clock))
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let clock = ManualClock::new(10_000);
        let (_backend, invalidator) = invalidator(&clock);

        let first = invalidator.invalidate_timestamp("node:1");
        assert_eq!(first, 10_000);
        // Same millisecond
        let second = invalidator.invalidate_timestamp("node:1");
        assert_eq!(second, 10_001);
        // Clock moved backwards
        clock.set(5_000);
        let third = invalidator.invalidate_timestamp("node:1");
        assert_eq!(third, 10_002);

        clock.set(20_000);
        assert_eq!(invalidator.invalidate_timestamp("node:1"), 20_000);
        assert_eq!(invalidator.last_timestamp("node:1"), Some(20_000));
    }

    #[test]
    fn test_last_timestamps_skips_unknown_tags() {
        let clock = ManualClock::new(1_000);
        let (_backend, invalidator) = invalidator(&clock);
        invalidator.invalidate_timestamp("a");

        let found = invalidator.last_timestamps(&["a", "b"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"], 1_000);
    }

    #[test]
    fn test_outage_still_returns_a_timestamp() {
        let clock = ManualClock::new(1_000);
        let (backend, invalidator) = invalidator(&clock);
        backend.set_down(true);
        assert_eq!(invalidator.invalidate_timestamp("a"), 1_000);
        assert_eq!(invalidator.last_timestamp("a"), None);
    }
}
