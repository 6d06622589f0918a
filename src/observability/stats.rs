//! Per-unit-of-work operation statistics
//!
//! A `RequestStats` accumulator is created by whoever owns the unit of work
//! (a request, a CLI invocation, a batch job), shared as `Arc` with every
//! adapter, and drained once at the end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

/// Atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// One key touched by one operation
#[derive(Debug, Clone, PartialEq)]
pub struct OpRecord {
    pub elapsed: Duration,
    pub action: String,
    pub bin: String,
    pub key: String,
    pub hit: bool,
}

/// Totals for one kind of operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpTotals {
    pub total_time: Duration,
    pub hits: u64,
    pub misses: u64,
}

/// Everything recorded since the last drain
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub records: Vec<OpRecord>,
    pub ops: BTreeMap<String, OpTotals>,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hit ratio over every recorded key, if anything was recorded
    pub fn hit_ratio(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let hits = self.records.iter().filter(|r| r.hit).count();
        Some(hits as f64 / self.records.len() as f64)
    }
}

/// Statistics accumulator shared by every adapter of one unit of work
#[derive(Debug, Default)]
pub struct RequestStats {
    current: Mutex<StatsSnapshot>,
    total_keys: Counter,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation that started at `started`, once per key
    pub fn record(&self, action: &str, bin: &str, started: Instant, keys: &[(String, bool)]) {
        let elapsed = started.elapsed();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());

        for (key, hit) in keys {
            current.records.push(OpRecord {
                elapsed,
                action: action.to_string(),
                bin: bin.to_string(),
                key: key.clone(),
                hit: *hit,
            });
            let totals = current.ops.entry(action.to_string()).or_default();
            totals.total_time += elapsed;
            if *hit {
                totals.hits += 1;
            } else {
                totals.misses += 1;
            }
        }
        self.total_keys.inc_by(keys.len() as u64);
    }

    /// Copy of what has been recorded so far
    pub fn snapshot(&self) -> StatsSnapshot {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take everything recorded so far, leaving the accumulator empty
    pub fn drain(&self) -> StatsSnapshot {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *current)
    }

    /// Keys recorded over the accumulator's lifetime, drains included
    pub fn lifetime_keys(&self) -> u64 {
        self.total_keys.get()
    }

    /// Drain and log a summary of the unit of work
    pub fn report(&self) -> StatsSnapshot {
        let snapshot = self.drain();
        for (action, totals) in &snapshot.ops {
            info!(
                action = %action,
                hits = totals.hits,
                misses = totals.misses,
                time_ms = format!("{:.2}", totals.total_time.as_secs_f64() * 1000.0),
                "memcache operations"
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let stats = RequestStats::new();
        let started = Instant::now();
        stats.record(
            "getMulti",
            "cache",
            started,
            &[("a".to_string(), true), ("b".to_string(), false)],
        );
        stats.record("set", "cache", started, &[("a".to_string(), true)]);

        let snapshot = stats.drain();
        assert_eq!(snapshot.records.len(), 3);
        assert_eq!(snapshot.ops["getMulti"].hits, 1);
        assert_eq!(snapshot.ops["getMulti"].misses, 1);
        assert_eq!(snapshot.ops["set"].hits, 1);
        assert_eq!(snapshot.hit_ratio(), Some(2.0 / 3.0));

        assert!(stats.snapshot().is_empty());
        assert_eq!(stats.lifetime_keys(), 3);
    }

    #[test]
    fn test_empty_snapshot_has_no_ratio() {
        let stats = RequestStats::new();
        assert_eq!(stats.report().hit_ratio(), None);
    }
}
