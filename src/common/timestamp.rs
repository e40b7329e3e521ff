//! The engine-wide timestamp source.
//!
//! Every ordering decision in the engine - transaction start and commit,
//! page versions, checkpoints - is serialized through one monotonically
//! increasing 64-bit counter. Recovery advances the counter past every
//! timestamp observed in the journal before the engine accepts new work.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point on the engine's logical clock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Timestamp 0 never names a real event; it tags primordial values.
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub fn new(t: u64) -> Self {
        Timestamp(t)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

/// The single allocator of timestamps.
///
/// Lock-free: `next` is a fetch-add, `current` a load. `advance_to` is used
/// by recovery to push the clock past replayed history.
#[derive(Debug)]
pub struct TimestampSource {
    counter: AtomicU64,
}

impl TimestampSource {
    pub fn new() -> Self {
        Self {
            // start at 1 so Timestamp::ZERO stays reserved
            counter: AtomicU64::new(1),
        }
    }

    /// Allocate the next timestamp.
    #[inline]
    pub fn next(&self) -> Timestamp {
        Timestamp(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// The most recently allocated timestamp.
    #[inline]
    pub fn current(&self) -> Timestamp {
        Timestamp(self.counter.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Ensure every future allocation is strictly greater than `ts`.
    pub fn advance_to(&self, ts: Timestamp) {
        let mut cur = self.counter.load(Ordering::SeqCst);
        while cur <= ts.0 {
            match self.counter.compare_exchange(
                cur,
                ts.0 + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }
}

impl Default for TimestampSource {
    fn default() -> Self {
        Self::new()
    }
}
