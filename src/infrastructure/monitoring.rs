// Router metrics - cheap atomic counters incremented on hot paths,
// snapshotted for the /metrics surface.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub cache_negative_hits: AtomicU64,
    /// Distributed cache calls that failed or timed out and degraded to a
    /// miss.
    pub cache_degraded: AtomicU64,
    pub directory_reads: AtomicU64,
    /// Read-only requests served by a master because no replica was healthy.
    pub replica_fallbacks: AtomicU64,
    pub validation_warnings: AtomicU64,
    pub validation_violations: AtomicU64,
    pub contexts_installed: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_negative_hits: self.cache_negative_hits.load(Ordering::Relaxed),
            cache_degraded: self.cache_degraded.load(Ordering::Relaxed),
            directory_reads: self.directory_reads.load(Ordering::Relaxed),
            replica_fallbacks: self.replica_fallbacks.load(Ordering::Relaxed),
            validation_warnings: self.validation_warnings.load(Ordering::Relaxed),
            validation_violations: self.validation_violations.load(Ordering::Relaxed),
            contexts_installed: self.contexts_installed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_negative_hits: u64,
    pub cache_degraded: u64,
    pub directory_reads: u64,
    pub replica_fallbacks: u64,
    pub validation_warnings: u64,
    pub validation_violations: u64,
    pub contexts_installed: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_over_snapshot() {
        let metrics = RouterMetrics::new();
        metrics.cache_hits.fetch_add(3, Ordering::Relaxed);
        metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert!((snap.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_zero_rate() {
        assert_eq!(RouterMetrics::new().snapshot().cache_hit_rate(), 0.0);
    }
}
