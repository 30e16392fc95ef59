//! # Cache Statistics
//!
//! Lightweight counters updated with relaxed atomics on the hot path.
//! `snapshot()` reads each counter once; the values may be skewed by a few
//! in-flight operations, which is acceptable for telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries removed by the eviction policy.
    pub evictions: u64,
    /// Entries removed because their time bound elapsed.
    pub expirations: u64,
    /// Loader invocations that produced a value.
    pub load_successes: u64,
    /// Loader invocations that failed or timed out.
    pub load_failures: u64,
    /// Total wall time spent inside loaders, in nanoseconds.
    pub total_load_time_ns: u64,
}

impl CacheStats {
    /// Total read operations observed.
    pub fn request_count(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of reads that hit, in `[0.0, 1.0]`; 1.0 when idle.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            1.0
        } else {
            self.hits as f64 / requests as f64
        }
    }

    /// Mean loader wall time per completed load, in nanoseconds.
    pub fn average_load_penalty_ns(&self) -> f64 {
        let loads = self.load_successes + self.load_failures;
        if loads == 0 {
            0.0
        } else {
            self.total_load_time_ns as f64 / loads as f64
        }
    }
}

/// Atomic accumulator behind [`CacheStats`].
///
/// When recording is disabled every method is a no-op, so an untracked
/// cache pays nothing beyond one branch.
#[derive(Debug)]
pub(crate) struct StatsRecorder {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time_ns: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn new(enabled: bool) -> Self {
        StatsRecorder {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            load_successes: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            total_load_time_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_hit(&self) {
        if self.enabled {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_miss(&self) {
        if self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_eviction(&self) {
        if self.enabled {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_expiration(&self) {
        if self.enabled {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_load_success(&self, elapsed: Duration) {
        if self.enabled {
            self.load_successes.fetch_add(1, Ordering::Relaxed);
            self.total_load_time_ns
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_load_failure(&self, elapsed: Duration) {
        if self.enabled {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
            self.total_load_time_ns
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            load_successes: self.load_successes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            total_load_time_ns: self.total_load_time_ns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_recorder_counts_nothing() {
        let recorder = StatsRecorder::new(false);
        recorder.record_hit();
        recorder.record_miss();
        recorder.record_load_success(Duration::from_millis(5));
        assert_eq!(recorder.snapshot(), CacheStats::default());
    }

    #[test]
    fn enabled_recorder_accumulates() {
        let recorder = StatsRecorder::new(true);
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        recorder.record_eviction();
        recorder.record_expiration();
        recorder.record_load_success(Duration::from_nanos(100));
        recorder.record_load_failure(Duration::from_nanos(50));

        let stats = recorder.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.load_successes, 1);
        assert_eq!(stats.load_failures, 1);
        assert_eq!(stats.total_load_time_ns, 150);
        assert_eq!(stats.request_count(), 3);
    }

    #[test]
    fn derived_ratios() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            load_successes: 2,
            total_load_time_ns: 1000,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.average_load_penalty_ns() - 500.0).abs() < f64::EPSILON);

        assert!((CacheStats::default().hit_rate() - 1.0).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().average_load_penalty_ns(), 0.0);
    }
}
