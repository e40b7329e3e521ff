//! RAII guards for page claims.
//!
//! These guards realize the pin/claim semantics on buffers:
//! - [`PageReadGuard`] - shared reader claim (many may coexist)
//! - [`PageWriteGuard`] - exclusive writer claim
//!
//! Both guards unpin the frame when dropped, so a forgotten unpin cannot
//! exist. A writer that modifies the page calls
//! [`PageWriteGuard::set_version`], which stamps the page and marks the
//! frame dirty; a writer claim that never modified anything leaves the
//! frame clean.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageAddress, Timestamp, VolumeHandle};
use crate::storage::page::Page;
use crate::storage::page_header::PageHeader;

use super::frame::FrameKey;
use super::pool::BufferPool;

/// Guard for a shared reader claim.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    frame_idx: usize,
    key: FrameKey,
    lock: RwLockReadGuard<'a, Page>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        frame_idx: usize,
        key: FrameKey,
        lock: RwLockReadGuard<'a, Page>,
    ) -> Self {
        Self {
            pool,
            frame_idx,
            key,
            lock,
        }
    }

    #[inline]
    pub fn volume(&self) -> VolumeHandle {
        self.key.0
    }

    #[inline]
    pub fn page_addr(&self) -> PageAddress {
        self.key.1
    }

    /// Version timestamp of the buffered page.
    #[inline]
    pub fn version(&self) -> Timestamp {
        self.lock.header().timestamp
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_internal(self.frame_idx);
    }
}

/// Guard for an exclusive writer claim.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    frame_idx: usize,
    key: FrameKey,
    lock: RwLockWriteGuard<'a, Page>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        frame_idx: usize,
        key: FrameKey,
        lock: RwLockWriteGuard<'a, Page>,
    ) -> Self {
        Self {
            pool,
            frame_idx,
            key,
            lock,
        }
    }

    #[inline]
    pub fn volume(&self) -> VolumeHandle {
        self.key.0
    }

    #[inline]
    pub fn page_addr(&self) -> PageAddress {
        self.key.1
    }

    #[inline]
    pub fn version(&self) -> Timestamp {
        self.lock.header().timestamp
    }

    /// Stamp the page with the modifying transaction's timestamp and mark
    /// the frame dirty. Every mutation of the page ends with this call.
    pub fn set_version(&mut self, ts: Timestamp) {
        let data = self.lock.as_mut_slice();
        data[PageHeader::OFFSET_TIMESTAMP..PageHeader::OFFSET_TIMESTAMP + 8]
            .copy_from_slice(&ts.0.to_be_bytes());
        let frame = self.pool.frame_at(self.frame_idx);
        frame.set_timestamp(ts);
        frame.mark_dirty();
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.lock
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_internal(self.frame_idx);
    }
}
