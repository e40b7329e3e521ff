//! Frame - a slot in the buffer pool.
//!
//! A [`Frame`] holds a [`Page`] plus the metadata buffer management needs:
//! - Which (volume, page) is loaded, if any
//! - Pin count for reference counting
//! - Dirty flag and the version timestamp of the last modification
//! - The journal address of the latest image record for the page
//! - The "touched" bit consulted by the clock eviction sweep

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{JournalAddress, PageAddress, Timestamp, VolumeHandle};
use crate::storage::page::Page;

/// Key of the page held by a frame.
pub type FrameKey = (VolumeHandle, PageAddress);

/// A frame in the buffer pool.
///
/// # Thread Safety
/// All fields use interior mutability for safe concurrent access:
/// - `page`: `RwLock` realizing reader/writer claims
/// - `key`: `Mutex` for safe updates
/// - everything else: atomics with relaxed ordering
pub struct Frame {
    /// The page image, protected by the claim lock.
    page: RwLock<Page>,

    /// Which page is currently loaded, or None if the frame is empty.
    key: Mutex<Option<FrameKey>>,

    /// Number of active claims on this frame.
    pin_count: AtomicU32,

    /// Whether the page has been modified since it was last written back.
    is_dirty: AtomicBool,

    /// Clock sweep "recently used" bit.
    touched: AtomicBool,

    /// Version timestamp of the last modification.
    timestamp: AtomicU64,

    /// Journal address of the newest page-image record covering the current
    /// content; 0 when the content has never been journaled.
    journal_addr: AtomicU64,
}

impl Frame {
    /// Create a new empty frame for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page: RwLock::new(Page::new(page_size)),
            key: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            touched: AtomicBool::new(false),
            timestamp: AtomicU64::new(0),
            journal_addr: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Page access (claim lock)
    // ------------------------------------------------------------------

    /// Acquire a reader claim on the page, blocking.
    #[inline]
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Acquire a writer claim on the page, blocking.
    #[inline]
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Try a reader claim within `timeout`.
    #[inline]
    pub fn try_page_for(
        &self,
        timeout: std::time::Duration,
    ) -> Option<RwLockReadGuard<'_, Page>> {
        self.page.try_read_for(timeout)
    }

    /// Try a writer claim within `timeout`.
    #[inline]
    pub fn try_page_mut_for(
        &self,
        timeout: std::time::Duration,
    ) -> Option<RwLockWriteGuard<'_, Page>> {
        self.page.try_write_for(timeout)
    }

    /// Non-blocking writer claim, used by the eviction sweep.
    #[inline]
    pub fn try_page_mut(&self) -> Option<RwLockWriteGuard<'_, Page>> {
        self.page.try_write()
    }

    // ------------------------------------------------------------------
    // Key management
    // ------------------------------------------------------------------

    #[inline]
    pub fn key(&self) -> Option<FrameKey> {
        *self.key.lock()
    }

    #[inline]
    pub fn set_key(&self, key: Option<FrameKey>) {
        *self.key.lock() = key;
    }

    // ------------------------------------------------------------------
    // Pin count
    // ------------------------------------------------------------------

    /// Increment the pin count. Returns the new pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.touched.store(true, Ordering::Relaxed);
        self.pin_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if the pin count is already 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    // ------------------------------------------------------------------
    // Dirty / touched / version state
    // ------------------------------------------------------------------

    #[inline]
    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Clear the clock bit; returns its previous value.
    #[inline]
    pub fn take_touched(&self) -> bool {
        self.touched.swap(false, Ordering::Relaxed)
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.timestamp.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_timestamp(&self, ts: Timestamp) {
        self.timestamp.store(ts.0, Ordering::Release);
    }

    /// Journal address of the newest image record, if any.
    #[inline]
    pub fn journal_addr(&self) -> Option<JournalAddress> {
        match self.journal_addr.load(Ordering::Acquire) {
            0 => None,
            addr => Some(JournalAddress::new(addr)),
        }
    }

    #[inline]
    pub fn set_journal_addr(&self, addr: JournalAddress) {
        self.journal_addr.store(addr.0, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Frame state
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key().is_none()
    }

    /// Reset the frame to the empty state. Called after eviction.
    pub fn reset(&self) {
        self.page_mut().reset();
        self.set_key(None);
        self.pin_count.store(0, Ordering::Relaxed);
        self.is_dirty.store(false, Ordering::Relaxed);
        self.touched.store(false, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
        self.journal_addr.store(0, Ordering::Relaxed);
    }
}
