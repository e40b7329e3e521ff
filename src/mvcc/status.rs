//! Transaction status records.
//!
//! A [`TransactionStatus`] lives in a stable slot of the transaction
//! index's slab; the slot index is its handle. Statuses move between three
//! lists - current, long-running, aborted - and through a free list for
//! reuse, all expressed as index lists onto the slab.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::common::{JournalAddress, Timestamp};

/// `commit_ts` value of a still-running transaction.
pub const COMMIT_PENDING: u64 = u64::MAX;
/// `commit_ts` value of an aborted transaction.
pub const TS_ABORTED: u64 = u64::MAX - 1;

/// Status of one transaction: start/commit timestamps plus bookkeeping.
#[derive(Debug)]
pub struct TransactionStatus {
    /// Start timestamp; the version tag this writer leaves in MVVs.
    start_ts: AtomicU64,
    /// Commit timestamp, [`COMMIT_PENDING`], or [`TS_ABORTED`].
    commit_ts: AtomicU64,
    /// Versions this writer has placed that pruning has not yet settled.
    pub mvv_count: AtomicU32,
    /// Journal address of this transaction's TS record; bounds the journal
    /// base address while the transaction runs.
    ts_record_addr: AtomicU64,
    /// Wall-clock begin, for long-running detection.
    started_at: Mutex<Option<Instant>>,
}

impl TransactionStatus {
    pub fn new() -> Self {
        Self {
            start_ts: AtomicU64::new(0),
            commit_ts: AtomicU64::new(COMMIT_PENDING),
            mvv_count: AtomicU32::new(0),
            ts_record_addr: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// Reinitialize a recycled status for a new transaction.
    pub fn reset_for(&self, start_ts: Timestamp, ts_record_addr: JournalAddress) {
        self.start_ts.store(start_ts.0, Ordering::Release);
        self.commit_ts.store(COMMIT_PENDING, Ordering::Release);
        self.mvv_count.store(0, Ordering::Relaxed);
        self.ts_record_addr.store(ts_record_addr.0, Ordering::Release);
        *self.started_at.lock() = Some(Instant::now());
    }

    #[inline]
    pub fn start_ts(&self) -> Timestamp {
        Timestamp::new(self.start_ts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn raw_commit_ts(&self) -> u64 {
        self.commit_ts.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.raw_commit_ts() == COMMIT_PENDING
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.raw_commit_ts() == TS_ABORTED
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        let raw = self.raw_commit_ts();
        raw != COMMIT_PENDING && raw != TS_ABORTED
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.raw_commit_ts() {
            COMMIT_PENDING | TS_ABORTED => None,
            ts => Some(Timestamp::new(ts)),
        }
    }

    pub fn set_committed(&self, commit_ts: Timestamp) {
        debug_assert!(self.is_active(), "commit of a finished transaction");
        self.commit_ts.store(commit_ts.0, Ordering::Release);
    }

    pub fn set_aborted(&self) {
        debug_assert!(self.is_active(), "abort of a finished transaction");
        self.commit_ts.store(TS_ABORTED, Ordering::Release);
    }

    #[inline]
    pub fn ts_record_addr(&self) -> JournalAddress {
        JournalAddress::new(self.ts_record_addr.load(Ordering::Acquire))
    }

    /// Wall-clock age of the transaction.
    pub fn age(&self) -> std::time::Duration {
        self.started_at
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl Default for TransactionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let status = TransactionStatus::new();
        status.reset_for(Timestamp::new(10), JournalAddress::new(100));

        assert!(status.is_active());
        assert!(!status.is_committed());
        assert_eq!(status.start_ts(), Timestamp::new(10));
        assert_eq!(status.commit_ts(), None);
        assert_eq!(status.ts_record_addr(), JournalAddress::new(100));

        status.set_committed(Timestamp::new(15));
        assert!(status.is_committed());
        assert_eq!(status.commit_ts(), Some(Timestamp::new(15)));
    }

    #[test]
    fn test_abort() {
        let status = TransactionStatus::new();
        status.reset_for(Timestamp::new(10), JournalAddress::new(100));
        status.set_aborted();
        assert!(status.is_aborted());
        assert!(!status.is_active());
        assert_eq!(status.commit_ts(), None);
    }

    #[test]
    fn test_reuse() {
        let status = TransactionStatus::new();
        status.reset_for(Timestamp::new(10), JournalAddress::new(100));
        status.set_committed(Timestamp::new(11));
        status.mvv_count.fetch_add(3, Ordering::Relaxed);

        status.reset_for(Timestamp::new(20), JournalAddress::new(200));
        assert!(status.is_active());
        assert_eq!(status.start_ts(), Timestamp::new(20));
        assert_eq!(status.mvv_count.load(Ordering::Relaxed), 0);
    }
}
