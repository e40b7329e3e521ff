//! Buffer Pool - the page caching layer.
//!
//! The [`BufferPool`] caches a fixed number of page frames for one page
//! size and serves pin/unpin requests:
//!
//! - `pin_read` / `pin_write` return RAII claims bound to a page image;
//!   no eviction can take the page away while a claim exists.
//! - `new_page` allocates from the volume and returns a pinned writer claim.
//! - Eviction is a clock-style sweep: an unpinned frame whose "touched" bit
//!   is clear is a candidate; clean candidates are evicted immediately,
//!   dirty candidates are written back first (journal image, then volume)
//!   through the [`PageWriteBack`] hook, honoring the rule that a page may
//!   only leave the pool once its image is durable in the journal.
//!
//! # Thread Safety
//! - `page_table`: `RwLock` - lookups take the read lock, load/evict the
//!   write lock. A frame with no claim can only gain one under the table
//!   read lock, so holding the write lock while checking `pin_count == 0`
//!   is enough to evict safely.
//! - `frames`: no lock - fixed size, each Frame has internal locks.
//! - `stats`: atomic counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::common::{Error, JournalAddress, PageAddress, Result, Timestamp, VolumeHandle};
use crate::storage::page::Page;
use crate::storage::Volume;

use super::frame::{Frame, FrameKey};
use super::page_guard::{PageReadGuard, PageWriteGuard};
use super::stats::{BufferPoolStats, PoolGauges};

/// How long a pin waits for a conflicting claim before timing out.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Write-back hook: journal the page image, then write it to its volume.
/// Returns the journal address of the image record. Installed by the root
/// object once the journal exists.
pub trait PageWriteBack: Send + Sync {
    fn write_back(&self, volume: VolumeHandle, page: PageAddress, image: &Page)
        -> Result<JournalAddress>;
}

/// A pool of buffer frames for one page size.
pub struct BufferPool {
    page_size: usize,
    frames: Vec<Frame>,
    page_table: RwLock<HashMap<FrameKey, usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: AtomicUsize,
    write_back: RwLock<Option<Arc<dyn PageWriteBack>>>,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a pool of `pool_size` frames of `page_size` bytes.
    ///
    /// # Panics
    /// Panics if `pool_size` is 0.
    pub fn new(pool_size: usize, page_size: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");

        let frames: Vec<Frame> = (0..pool_size).map(|_| Frame::new(page_size)).collect();
        let free_list: Vec<usize> = (0..pool_size).rev().collect();

        Self {
            page_size,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: AtomicUsize::new(0),
            write_back: RwLock::new(None),
            stats: BufferPoolStats::new(),
        }
    }

    /// Install the write-back hook. Until this is set, dirty frames are not
    /// evictable.
    pub fn set_write_back(&self, hook: Arc<dyn PageWriteBack>) {
        *self.write_back.write() = Some(hook);
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn frame_at(&self, idx: usize) -> &Frame {
        &self.frames[idx]
    }

    // ------------------------------------------------------------------
    // Public API: claims
    // ------------------------------------------------------------------

    /// Pin a page with a reader claim, loading it from `volume` on a miss.
    pub fn pin_read<'a>(&'a self, volume: &Volume, addr: PageAddress) -> Result<PageReadGuard<'a>> {
        let key = (volume.handle(), addr);
        let frame_idx = self.locate_or_load(volume, addr)?;
        let frame = &self.frames[frame_idx];

        match frame.try_page_for(CLAIM_TIMEOUT) {
            Some(lock) => {
                self.stats.reader_claims.fetch_add(1, Ordering::Relaxed);
                Ok(PageReadGuard::new(self, frame_idx, key, lock))
            }
            None => {
                frame.unpin();
                Err(Error::ClaimTimeout {
                    volume: key.0,
                    page: addr,
                    mode: "reader",
                })
            }
        }
    }

    /// Pin a page with an exclusive writer claim.
    pub fn pin_write<'a>(
        &'a self,
        volume: &Volume,
        addr: PageAddress,
    ) -> Result<PageWriteGuard<'a>> {
        let key = (volume.handle(), addr);
        let frame_idx = self.locate_or_load(volume, addr)?;
        let frame = &self.frames[frame_idx];

        match frame.try_page_mut_for(CLAIM_TIMEOUT) {
            Some(lock) => {
                self.stats.writer_claims.fetch_add(1, Ordering::Relaxed);
                Ok(PageWriteGuard::new(self, frame_idx, key, lock))
            }
            None => {
                frame.unpin();
                Err(Error::ClaimTimeout {
                    volume: key.0,
                    page: addr,
                    mode: "writer",
                })
            }
        }
    }

    /// Allocate a fresh page in `volume` and return it under a writer claim.
    /// The page arrives zeroed; the caller formats it.
    pub fn new_page<'a>(
        &'a self,
        volume: &Volume,
    ) -> Result<(PageAddress, PageWriteGuard<'a>)> {
        let addr = volume.allocate()?;
        let key = (volume.handle(), addr);

        let frame_idx = self.take_free_frame()?;
        let frame = &self.frames[frame_idx];
        frame.page_mut().reset();
        // pin before publishing the key so the sweep can never pick this
        // frame while it is being set up
        frame.pin();
        frame.set_key(Some(key));

        {
            let mut table = self.page_table.write();
            let prev = table.insert(key, frame_idx);
            debug_assert!(prev.is_none(), "fresh page already mapped");
        }

        let lock = frame.page_mut();
        self.stats.writer_claims.fetch_add(1, Ordering::Relaxed);
        Ok((addr, PageWriteGuard::new(self, frame_idx, key, lock)))
    }

    /// Drop a page from the pool if present and unclaimed (freed pages).
    /// Returns false when the page is currently claimed.
    pub fn invalidate(&self, key: FrameKey) -> bool {
        let mut table = self.page_table.write();
        let Some(&idx) = table.get(&key) else {
            return true;
        };
        let frame = &self.frames[idx];
        if frame.is_pinned() {
            return false;
        }
        let Some(lock) = frame.try_page_mut() else {
            return false;
        };
        table.remove(&key);
        drop(lock);
        frame.reset();
        self.free_list.lock().push(idx);
        true
    }

    // ------------------------------------------------------------------
    // Public API: write-back and gauges
    // ------------------------------------------------------------------

    /// Write one dirty page back (journal image + volume write). Returns
    /// true if a write-back happened, false if the page was absent or clean.
    pub fn write_back_page(&self, key: FrameKey) -> Result<bool> {
        let frame_idx = {
            let table = self.page_table.read();
            match table.get(&key) {
                Some(&idx) => {
                    self.frames[idx].pin();
                    idx
                }
                None => return Ok(false),
            }
        };
        let frame = &self.frames[frame_idx];

        let result = (|| {
            let lock = frame
                .try_page_for(CLAIM_TIMEOUT)
                .ok_or(Error::ClaimTimeout {
                    volume: key.0,
                    page: key.1,
                    mode: "reader",
                })?;
            if !frame.is_dirty() {
                return Ok(false);
            }
            let hook = self
                .write_back
                .read()
                .clone()
                .ok_or_else(|| Error::Config("write-back hook not installed".into()))?;
            let journal_addr = hook.write_back(key.0, key.1, &lock)?;
            frame.set_journal_addr(journal_addr);
            frame.clear_dirty();
            self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        })();

        frame.unpin();
        if result.is_err() {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Keys of dirty frames whose version is strictly below `before`
    /// (all dirty frames when `before` is `None`).
    pub fn dirty_keys(&self, before: Option<Timestamp>) -> Vec<FrameKey> {
        let mut keys = Vec::new();
        for frame in &self.frames {
            if !frame.is_dirty() {
                continue;
            }
            if let Some(limit) = before {
                if frame.timestamp() >= limit {
                    continue;
                }
            }
            if let Some(key) = frame.key() {
                keys.push(key);
            }
        }
        keys
    }

    /// The smallest journal address any dirty frame still references.
    /// Bounds how far the journal base address may advance.
    pub fn min_dirty_journal_addr(&self) -> Option<JournalAddress> {
        self.frames
            .iter()
            .filter(|f| f.is_dirty())
            .filter_map(|f| f.journal_addr())
            .min()
    }

    /// Approximate valid/dirty/claimed frame counts.
    pub fn gauges(&self) -> PoolGauges {
        let mut gauges = PoolGauges::default();
        for frame in &self.frames {
            if !frame.is_empty() {
                gauges.valid += 1;
            }
            if frame.is_dirty() {
                gauges.dirty += 1;
            }
            if frame.is_pinned() {
                gauges.claimed += 1;
            }
        }
        gauges
    }

    /// One clock pass run by the eviction task: clears touched bits and
    /// moves unpinned, untouched, clean frames to the free list until a
    /// quarter of the pool is free. Dirty frames are left for the copier.
    pub fn eviction_sweep(&self) {
        let target = (self.frames.len() / 4).max(1);
        for _ in 0..self.frames.len() {
            if self.free_list.lock().len() >= target {
                return;
            }
            let idx = self.advance_clock();
            let frame = &self.frames[idx];
            if frame.is_empty() || frame.is_pinned() || frame.take_touched() || frame.is_dirty() {
                continue;
            }
            self.try_evict(idx);
        }
    }

    // ------------------------------------------------------------------
    // Internal: called by guards on drop
    // ------------------------------------------------------------------

    pub(crate) fn unpin_internal(&self, frame_idx: usize) {
        self.frames[frame_idx].unpin();
    }

    // ------------------------------------------------------------------
    // Internal: locate / load / evict
    // ------------------------------------------------------------------

    /// Find the frame holding `addr`, loading from the volume on a miss.
    /// The returned frame is pinned.
    fn locate_or_load(&self, volume: &Volume, addr: PageAddress) -> Result<usize> {
        let key = (volume.handle(), addr);
        loop {
            {
                let table = self.page_table.read();
                if let Some(&idx) = table.get(&key) {
                    self.frames[idx].pin();
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(idx);
                }
            }

            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            let idx = self.take_free_frame()?;

            // read outside the table lock; the frame is invisible until
            // inserted below
            let page = match volume.read_page(addr) {
                Ok(page) => page,
                Err(e) => {
                    self.free_list.lock().push(idx);
                    return Err(e);
                }
            };
            self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

            let frame = &self.frames[idx];
            {
                let mut table = self.page_table.write();
                if table.contains_key(&key) {
                    // another thread loaded it first; retry as a hit
                    self.free_list.lock().push(idx);
                    continue;
                }
                frame.page_mut().copy_from(page.as_slice());
                frame.set_key(Some(key));
                frame.set_timestamp(page.header().timestamp);
                frame.pin();
                table.insert(key, idx);
            }
            return Ok(idx);
        }
    }

    /// Pop a free frame, running the clock sweep when the list is empty.
    fn take_free_frame(&self) -> Result<usize> {
        if let Some(idx) = self.free_list.lock().pop() {
            return Ok(idx);
        }

        // two full passes: the first clears touched bits, the second evicts
        for _ in 0..self.frames.len() * 2 {
            let idx = self.advance_clock();
            let frame = &self.frames[idx];
            if frame.is_empty() || frame.is_pinned() || frame.take_touched() {
                continue;
            }
            if frame.is_dirty() && !self.write_back_candidate(idx) {
                continue;
            }
            if self.try_evict(idx) {
                if let Some(free) = self.free_list.lock().pop() {
                    return Ok(free);
                }
            }
        }
        Err(Error::PoolSaturated)
    }

    #[inline]
    fn advance_clock(&self) -> usize {
        self.clock_hand.fetch_add(1, Ordering::Relaxed) % self.frames.len()
    }

    /// Write a dirty candidate back so it becomes evictable. Returns true
    /// when the frame is clean afterwards.
    fn write_back_candidate(&self, idx: usize) -> bool {
        let frame = &self.frames[idx];
        let Some(key) = frame.key() else {
            return false;
        };
        match self.write_back_page(key) {
            Ok(_) => !frame.is_dirty(),
            Err(e) => {
                warn!("write-back of {}/{} failed: {}", key.0, key.1, e);
                false
            }
        }
    }

    /// Evict a clean, unpinned frame onto the free list.
    fn try_evict(&self, idx: usize) -> bool {
        let frame = &self.frames[idx];
        let mut table = self.page_table.write();
        if frame.is_pinned() || frame.is_dirty() {
            return false;
        }
        let Some(lock) = frame.try_page_mut() else {
            return false;
        };
        if let Some(key) = frame.key() {
            table.remove(&key);
        }
        drop(table);
        drop(lock);
        frame.reset();
        self.free_list.lock().push(idx);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::VolumeSpec;
    use crate::storage::page_header::{PageHeader, PageType};
    use tempfile::tempdir;

    struct NoJournal;
    impl PageWriteBack for NoJournal {
        fn write_back(
            &self,
            _volume: VolumeHandle,
            _page: PageAddress,
            _image: &Page,
        ) -> Result<JournalAddress> {
            Ok(JournalAddress::new(1))
        }
    }

    fn test_volume(dir: &std::path::Path) -> Volume {
        let mut spec = VolumeSpec::new("test.v01", "test", 1024);
        spec.initial_pages = 4;
        Volume::open_or_create(&dir.join("test.v01"), &spec, VolumeHandle::new(1)).unwrap()
    }

    fn stamp_leaf(guard: &mut PageWriteGuard<'_>, ts: u64) {
        let size = guard.size();
        guard.set_header(&PageHeader::new(PageType::DataLeaf, size));
        guard.set_version(Timestamp::new(ts));
    }

    #[test]
    fn test_new_page_and_fetch() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);

        let addr = {
            let (addr, mut guard) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut guard, 5);
            guard.as_mut_slice()[100] = 0xAB;
            addr
        };

        let guard = pool.pin_read(&volume, addr).unwrap();
        assert_eq!(guard.as_slice()[100], 0xAB);
        assert_eq!(guard.version(), Timestamp::new(5));
    }

    #[test]
    fn test_cache_hit_counting() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);

        let (addr, _) = {
            let (addr, mut guard) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut guard, 1);
            (addr, ())
        };

        drop(pool.pin_read(&volume, addr).unwrap());
        drop(pool.pin_read(&volume, addr).unwrap());
        assert!(pool.stats().snapshot().cache_hits >= 2);
    }

    #[test]
    fn test_multiple_reader_claims() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);

        let (addr, _) = {
            let (addr, mut guard) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut guard, 1);
            (addr, ())
        };

        let a = pool.pin_read(&volume, addr).unwrap();
        let b = pool.pin_read(&volume, addr).unwrap();
        assert_eq!(a.page_addr(), b.page_addr());
    }

    #[test]
    fn test_eviction_writes_back_dirty() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(4, 1024);
        pool.set_write_back(Arc::new(NoJournal));

        // dirty more pages than the pool holds; evictions must write back
        let mut addrs = Vec::new();
        for i in 0..8u8 {
            let (addr, mut guard) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut guard, 10 + i as u64);
            guard.as_mut_slice()[200] = i;
            addrs.push(addr);
        }

        // write-back happens through the hook, but volume writes only at
        // checkpoint/copy time in production; here the hook skipped the
        // volume, so pages still in the pool must read correctly
        let snapshot = pool.stats().snapshot();
        assert!(snapshot.evictions >= 4);
    }

    #[test]
    fn test_pool_saturated_when_all_pinned() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(2, 1024);

        let (_, mut g1) = pool.new_page(&volume).unwrap();
        stamp_leaf(&mut g1, 1);
        let (_, mut g2) = pool.new_page(&volume).unwrap();
        stamp_leaf(&mut g2, 1);

        assert!(matches!(pool.new_page(&volume), Err(Error::PoolSaturated)));
    }

    #[test]
    fn test_dirty_keys_and_gauges() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);

        let (addr1, _) = {
            let (a, mut g) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut g, 5);
            (a, ())
        };
        let (_addr2, _) = {
            let (a, mut g) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut g, 9);
            (a, ())
        };

        assert_eq!(pool.dirty_keys(None).len(), 2);
        let old = pool.dirty_keys(Some(Timestamp::new(6)));
        assert_eq!(old, vec![(volume.handle(), addr1)]);

        let gauges = pool.gauges();
        assert_eq!(gauges.valid, 2);
        assert_eq!(gauges.dirty, 2);
        assert_eq!(gauges.claimed, 0);
    }

    #[test]
    fn test_write_back_page_clears_dirty() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);
        pool.set_write_back(Arc::new(NoJournal));

        let (addr, _) = {
            let (a, mut g) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut g, 5);
            (a, ())
        };
        let key = (volume.handle(), addr);

        assert!(pool.write_back_page(key).unwrap());
        assert!(!pool.write_back_page(key).unwrap()); // already clean
        assert_eq!(pool.dirty_keys(None).len(), 0);
    }

    #[test]
    fn test_invalidate() {
        let dir = tempdir().unwrap();
        let volume = test_volume(dir.path());
        let pool = BufferPool::new(8, 1024);
        pool.set_write_back(Arc::new(NoJournal));

        let (addr, _) = {
            let (a, mut g) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut g, 5);
            (a, ())
        };
        let key = (volume.handle(), addr);

        {
            let _claim = pool.pin_read(&volume, addr).unwrap();
            assert!(!pool.invalidate(key)); // claimed
        }
        assert!(pool.invalidate(key));
        assert_eq!(pool.gauges().valid, 0);
    }

    #[test]
    fn test_concurrent_readers_across_threads() {
        use std::thread;

        let dir = tempdir().unwrap();
        let volume = Arc::new(test_volume(dir.path()));
        let pool = Arc::new(BufferPool::new(8, 1024));

        let (addr, _) = {
            let (a, mut g) = pool.new_page(&volume).unwrap();
            stamp_leaf(&mut g, 1);
            g.as_mut_slice()[50] = 0x42;
            (a, ())
        };

        let mut handles = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let volume = Arc::clone(&volume);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let guard = pool.pin_read(&volume, addr).unwrap();
                    assert_eq!(guard.as_slice()[50], 0x42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
