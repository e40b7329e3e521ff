//! The transaction index.
//!
//! Owns every [`TransactionStatus`] in a grow-only slab of stable slots,
//! hashed by start timestamp into per-bucket locks. Three index lists -
//! current, long-running, aborted - plus a free list for slot reuse.
//!
//! The *active-transaction cache* answers visibility and pruning queries
//! without touching the buckets: `active_transaction_floor` is a lower
//! bound on every running transaction's start timestamp, and
//! `active_transaction_ceiling` is the highest start timestamp the cache
//! has observed; anything above it is conservatively treated as possibly
//! active. [`TransactionIndex::update_active_cache`] rebuilds the snapshot
//! under an exclusive lock and atomically swaps it in, retiring settled
//! statuses on the way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::common::{Error, JournalAddress, Result, Timestamp};
use crate::mvcc::mvv::Disposition;
use crate::mvcc::status::TransactionStatus;

const BUCKET_COUNT: usize = 64;

/// Active transactions older than this move to the long-running list.
const LONG_RUNNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Handle to a transaction's status slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub slot: usize,
    pub start_ts: Timestamp,
}

/// Depths of the index lists, for the statistics surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexDepths {
    pub current: usize,
    pub long_running: usize,
    pub aborted: usize,
    pub free: usize,
}

pub struct TransactionIndex {
    buckets: Vec<Mutex<HashMap<u64, usize>>>,
    slab: RwLock<Vec<Arc<TransactionStatus>>>,
    free: Mutex<Vec<usize>>,
    current: Mutex<Vec<usize>>,
    long_running: Mutex<Vec<usize>>,
    aborted: Mutex<Vec<usize>>,

    /// No active transaction has a smaller start timestamp.
    floor: AtomicU64,
    /// Highest start timestamp the cache has observed.
    ceiling: AtomicU64,
    /// Highest start timestamp ever begun (feeds the floor when idle).
    max_seen_start: AtomicU64,
    /// Sorted start timestamps of transactions active at the last refresh.
    active_snapshot: RwLock<Arc<Vec<u64>>>,
    /// Serializes cache refreshes.
    refresh_lock: Mutex<()>,

    max_concurrent: usize,
}

impl TransactionIndex {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            slab: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            current: Mutex::new(Vec::new()),
            long_running: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            floor: AtomicU64::new(1),
            ceiling: AtomicU64::new(0),
            max_seen_start: AtomicU64::new(0),
            active_snapshot: RwLock::new(Arc::new(Vec::new())),
            refresh_lock: Mutex::new(()),
            max_concurrent,
        }
    }

    #[inline]
    fn bucket_of(&self, start_ts: Timestamp) -> &Mutex<HashMap<u64, usize>> {
        &self.buckets[(start_ts.0 as usize) % BUCKET_COUNT]
    }

    fn status_at(&self, slot: usize) -> Arc<TransactionStatus> {
        Arc::clone(&self.slab.read()[slot])
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a transaction that began at `start_ts` with its TS record
    /// at `ts_record_addr`.
    pub fn begin(&self, start_ts: Timestamp, ts_record_addr: JournalAddress) -> Result<TxHandle> {
        if self.current.lock().len() + self.long_running.lock().len() >= self.max_concurrent {
            return Err(Error::TooManyTransactions(self.max_concurrent));
        }

        let slot = match self.free.lock().pop() {
            Some(slot) => slot,
            None => {
                let mut slab = self.slab.write();
                slab.push(Arc::new(TransactionStatus::new()));
                slab.len() - 1
            }
        };

        self.status_at(slot).reset_for(start_ts, ts_record_addr);
        self.bucket_of(start_ts).lock().insert(start_ts.0, slot);
        self.current.lock().push(slot);

        self.max_seen_start.fetch_max(start_ts.0, Ordering::AcqRel);
        self.ceiling.fetch_max(start_ts.0, Ordering::AcqRel);
        self.floor.fetch_min(start_ts.0, Ordering::AcqRel);

        Ok(TxHandle { slot, start_ts })
    }

    /// Record a commit.
    pub fn commit(&self, handle: TxHandle, commit_ts: Timestamp) {
        let status = self.status_at(handle.slot);
        debug_assert_eq!(status.start_ts(), handle.start_ts);
        status.set_committed(commit_ts);
        self.current.lock().retain(|&s| s != handle.slot);
        self.long_running.lock().retain(|&s| s != handle.slot);
    }

    /// Record an abort. The status stays on the aborted list until pruning
    /// has removed every version the transaction wrote.
    pub fn abort(&self, handle: TxHandle) {
        let status = self.status_at(handle.slot);
        debug_assert_eq!(status.start_ts(), handle.start_ts);
        status.set_aborted();
        self.current.lock().retain(|&s| s != handle.slot);
        self.long_running.lock().retain(|&s| s != handle.slot);
        self.aborted.lock().push(handle.slot);
    }

    /// Register a transaction recovery found begun but never committed.
    /// Its status is pinned as aborted so any of its versions still
    /// sitting in copied-back pages stay invisible; pruning removes them
    /// as pages are revisited.
    pub fn register_recovered_aborted(&self, start_ts: Timestamp) {
        let slot = match self.free.lock().pop() {
            Some(slot) => slot,
            None => {
                let mut slab = self.slab.write();
                slab.push(Arc::new(TransactionStatus::new()));
                slab.len() - 1
            }
        };
        let status = self.status_at(slot);
        status.reset_for(start_ts, JournalAddress::ZERO);
        status.set_aborted();
        // the true version count is unknown; pin the status for the life
        // of the session rather than risk resurrecting aborted data
        status.mvv_count.store(u32::MAX / 2, Ordering::Relaxed);
        self.bucket_of(start_ts).lock().insert(start_ts.0, slot);
        self.aborted.lock().push(slot);
        self.max_seen_start.fetch_max(start_ts.0, Ordering::AcqRel);
    }

    /// Bump the writer's outstanding-version count.
    pub fn note_version_written(&self, handle: TxHandle) {
        self.status_at(handle.slot)
            .mvv_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A version tagged with `writer_ts` was settled or discarded by
    /// pruning.
    pub fn note_version_pruned(&self, writer_ts: Timestamp) {
        if writer_ts == Timestamp::ZERO {
            return;
        }
        if let Some(&slot) = self.bucket_of(writer_ts).lock().get(&writer_ts.0) {
            let status = self.status_at(slot);
            let count = &status.mvv_count;
            let mut cur = count.load(Ordering::Relaxed);
            while cur > 0 {
                match count.compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Resolve a version writer for visibility decisions. A writer absent
    /// from the index settled before every live reader began.
    pub fn disposition(&self, writer_ts: Timestamp) -> Disposition {
        if writer_ts == Timestamp::ZERO {
            return Disposition::Committed(Timestamp::ZERO);
        }
        let slot = match self.bucket_of(writer_ts).lock().get(&writer_ts.0) {
            Some(&slot) => slot,
            None => return Disposition::Committed(Timestamp::ZERO),
        };
        let status = self.status_at(slot);
        if status.start_ts() != writer_ts {
            // slot was recycled; the writer settled long ago
            return Disposition::Committed(Timestamp::ZERO);
        }
        if status.is_active() {
            Disposition::Active
        } else if status.is_aborted() {
            Disposition::Aborted
        } else {
            Disposition::Committed(status.commit_ts().expect("committed"))
        }
    }

    /// Whether any transaction with a start timestamp in `(low, high]` may
    /// still be active. Conservative above the cache ceiling.
    pub fn has_concurrent(&self, low: Timestamp, high: Timestamp) -> bool {
        if high.0 > self.ceiling.load(Ordering::Acquire) {
            return true;
        }
        let snapshot = Arc::clone(&self.active_snapshot.read());
        let from = snapshot.partition_point(|&t| t <= low.0);
        let to = snapshot.partition_point(|&t| t <= high.0);
        from < to
    }

    /// Lower bound on every active transaction's start timestamp.
    pub fn active_transaction_floor(&self) -> Timestamp {
        Timestamp::new(self.floor.load(Ordering::Acquire))
    }

    /// Timestamp captured at the last cache refresh.
    pub fn active_transaction_ceiling(&self) -> Timestamp {
        Timestamp::new(self.ceiling.load(Ordering::Acquire))
    }

    /// True when every transaction with `start_ts < ct` has finished.
    /// Checkpoint confirmation polls this.
    pub fn all_before_finished(&self, ct: Timestamp) -> bool {
        let slab = self.slab.read();
        for list in [&self.current, &self.long_running] {
            for &slot in list.lock().iter() {
                let status = &slab[slot];
                if status.is_active() && status.start_ts() < ct {
                    return false;
                }
            }
        }
        true
    }

    /// Journal address of the oldest active transaction's TS record; bounds
    /// the journal base address.
    pub fn oldest_active_ts_addr(&self) -> Option<JournalAddress> {
        let slab = self.slab.read();
        let mut min: Option<JournalAddress> = None;
        for list in [&self.current, &self.long_running] {
            for &slot in list.lock().iter() {
                let status = &slab[slot];
                if status.is_active() {
                    let addr = status.ts_record_addr();
                    min = Some(match min {
                        Some(m) if m <= addr => m,
                        _ => addr,
                    });
                }
            }
        }
        min
    }

    /// `(start_ts, ts_record_addr)` of every active transaction; recorded
    /// in CP records so recovery knows how far back replay must reach.
    pub fn active_transactions(&self) -> Vec<(Timestamp, JournalAddress)> {
        let slab = self.slab.read();
        let mut active = Vec::new();
        for list in [&self.current, &self.long_running] {
            for &slot in list.lock().iter() {
                let status = &slab[slot];
                if status.is_active() {
                    active.push((status.start_ts(), status.ts_record_addr()));
                }
            }
        }
        active
    }

    pub fn depths(&self) -> IndexDepths {
        IndexDepths {
            current: self.current.lock().len(),
            long_running: self.long_running.lock().len(),
            aborted: self.aborted.lock().len(),
            free: self.free.lock().len(),
        }
    }

    // ------------------------------------------------------------------
    // Cache refresh
    // ------------------------------------------------------------------

    /// Rebuild the active-transaction cache and retire settled statuses.
    ///
    /// Builds the new snapshot on the side, then swaps it in; readers keep
    /// using the old `Arc` until they drop it.
    pub fn update_active_cache(&self) {
        let _exclusive = self.refresh_lock.lock();
        let slab = self.slab.read();

        // migrate aged transactions to the long-running list
        {
            let mut current = self.current.lock();
            let mut long_running = self.long_running.lock();
            let mut keep = Vec::with_capacity(current.len());
            for &slot in current.iter() {
                let status = &slab[slot];
                if status.is_active() && status.age() >= LONG_RUNNING_THRESHOLD {
                    long_running.push(slot);
                } else {
                    keep.push(slot);
                }
            }
            *current = keep;
        }

        // gather active start timestamps
        let mut active: Vec<u64> = Vec::new();
        for list in [&self.current, &self.long_running] {
            for &slot in list.lock().iter() {
                let status = &slab[slot];
                if status.is_active() {
                    active.push(status.start_ts().0);
                }
            }
        }
        active.sort_unstable();

        let floor = active
            .first()
            .copied()
            .unwrap_or_else(|| self.max_seen_start.load(Ordering::Acquire) + 1);
        let ceiling = self.max_seen_start.load(Ordering::Acquire);

        *self.active_snapshot.write() = Arc::new(active);
        self.floor.store(floor, Ordering::Release);
        self.ceiling.store(ceiling, Ordering::Release);

        // retire committed statuses no live reader can distinguish from
        // primordial, and aborted statuses whose versions are fully pruned
        let mut freed: Vec<usize> = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            bucket.retain(|_, &mut slot| {
                let status = &slab[slot];
                let retire = match () {
                    _ if status.is_committed() => {
                        status.commit_ts().map(|c| c.0).unwrap_or(u64::MAX) < floor
                    }
                    _ if status.is_aborted() => {
                        status.mvv_count.load(Ordering::Relaxed) == 0
                    }
                    _ => false,
                };
                if retire {
                    freed.push(slot);
                }
                !retire
            });
        }
        if !freed.is_empty() {
            self.aborted.lock().retain(|slot| !freed.contains(slot));
            self.free.lock().extend(freed);
        }
    }
}
