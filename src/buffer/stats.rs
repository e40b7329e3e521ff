//! Buffer pool statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics tracked by the buffer pool.
///
/// All fields are atomic for lock-free, thread-safe updates; relaxed
/// ordering is enough because the counters are only ever read as an
/// approximate snapshot.
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Times a page was found in the pool.
    pub cache_hits: AtomicU64,
    /// Times a page had to be read from its volume.
    pub cache_misses: AtomicU64,
    /// Frames evicted by the clock sweep or on-demand reclaim.
    pub evictions: AtomicU64,
    /// Pages read from volumes.
    pub pages_read: AtomicU64,
    /// Pages written back to volumes.
    pub pages_written: AtomicU64,
    /// Reader claims granted.
    pub reader_claims: AtomicU64,
    /// Writer claims granted.
    pub writer_claims: AtomicU64,
    /// Write-back failures surfaced to the alert monitor and retried.
    pub write_errors: AtomicU64,
}

impl BufferPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// A non-atomic copy for display and logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            reader_claims: self.reader_claims.load(Ordering::Relaxed),
            writer_claims: self.writer_claims.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of buffer pool statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub reader_claims: u64,
    pub writer_claims: u64,
    pub write_errors: u64,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ hits: {}, misses: {}, evictions: {}, written: {}, hit_rate: {:.2}% }}",
            self.cache_hits,
            self.cache_misses,
            self.evictions,
            self.pages_written,
            self.hit_rate() * 100.0
        )
    }
}

/// Approximate live gauges of the pool, computed on demand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolGauges {
    /// Frames holding a valid page.
    pub valid: usize,
    /// Frames holding a dirty page.
    pub dirty: usize,
    /// Frames with at least one claim.
    pub claimed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = BufferPoolStats::new();
        assert_eq!(stats.cache_hits.load(Ordering::Relaxed), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = BufferPoolStats::new();
        stats.cache_hits.fetch_add(7, Ordering::Relaxed);
        stats.cache_misses.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.hit_rate(), 0.7);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 7);
        assert_eq!(snapshot.hit_rate(), 0.7);
    }

    #[test]
    fn test_display() {
        let stats = BufferPoolStats::new();
        stats.cache_hits.fetch_add(80, Ordering::Relaxed);
        stats.cache_misses.fetch_add(20, Ordering::Relaxed);
        let text = format!("{}", stats.snapshot());
        assert!(text.contains("hits: 80"));
        assert!(text.contains("80.00%"));
    }
}
