//! The cursor ("exchange"): a thread-owned handle on one tree.
//!
//! All tree operations flow through here: `fetch`, `store`, `remove`,
//! `remove_range`, and `traverse` with the five seek directions and the
//! deep/shallow distinction of the hierarchical key model.
//!
//! # Claim discipline
//! Reads descend with reader claims, releasing the parent once the child is
//! pinned (crab-walking). Writes descend with writer claims, releasing all
//! ancestors as soon as the child is "safe" (cannot split or empty); when a
//! leaf turns out to need a split after all, the ancestors have already
//! been released, so the operation retries with the full path held.
//!
//! # Write ordering
//! Every logical update appends its journal record (SR/DR) *before*
//! touching a page, and every touched page is stamped with a fresh
//! timestamp and marked dirty, which is what ties buffers to the journal's
//! base-address accounting.
//!
//! A cursor is deliberately `!Send`: it is owned by the thread that created
//! it, so cross-thread misuse is unrepresentable.

use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;

use crate::buffer::{PageReadGuard, PageWriteGuard};
use crate::cleanup::CleanupAction;
use crate::common::{Error, PageAddress, Result, Timestamp};
use crate::journal::record::RecordPayload;
use crate::key::Key;
use crate::mvcc::mvv::{self, Pruned};
use crate::storage::data_page::{
    can_join, max_inline_record, DataPage, DataPageMut, LongRecordPointer, SplitPolicy, FLAG_LONG,
    FLAG_MVV, RECORD_OVERHEAD,
};
use crate::storage::page_header::{PageHeader, PageType};
use crate::txn::Transaction;

use super::{Tree, TreeContext};

/// Seek direction for [`Cursor::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Lt,
    LtEq,
    Eq,
    GtEq,
    Gt,
}

/// Result of a traversal step.
#[derive(Debug, Clone, PartialEq)]
pub struct TraverseResult {
    pub key: Key,
    /// The visible value at `key`; `None` when a shallow traversal landed
    /// on a sibling prefix that carries no value of its own.
    pub value: Option<Vec<u8>>,
}

/// Writer identity for the internal apply paths.
#[derive(Clone, Copy)]
enum WriteAs<'a> {
    /// Primordial write (recovery replay, directory maintenance). Replaces
    /// any existing versions outright.
    System(Timestamp),
    /// Transactional write: appended as an MVV version.
    Tx(&'a Transaction),
}

pub struct Cursor {
    ctx: Arc<TreeContext>,
    tree: Tree,
    split_policy: std::cell::Cell<SplitPolicy>,
    _not_send: PhantomData<*const ()>,
}

impl Cursor {
    pub fn new(ctx: Arc<TreeContext>, tree: Tree) -> Self {
        Self {
            ctx,
            tree,
            split_policy: std::cell::Cell::new(SplitPolicy::default()),
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Select the split-point policy applied to splits this cursor causes.
    /// Policies only steer where a page divides; correctness is policy
    /// independent.
    pub fn set_split_policy(&self, policy: SplitPolicy) {
        self.split_policy.set(policy);
    }

    fn resolver(&self) -> impl Fn(Timestamp) -> mvv::Disposition + '_ {
        move |writer| self.ctx.tx_index.disposition(writer)
    }

    // ==================================================================
    // Public transactional API
    // ==================================================================

    /// Store `value` under `key` for `txn`.
    pub fn store(&self, txn: &Transaction, key: &Key, value: &[u8]) -> Result<()> {
        key.check_storable(self.ctx.max_key_size)?;
        if value.len() > self.ctx.max_value_size {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max: self.ctx.max_value_size,
            });
        }
        txn.require_active()?;

        if self.ctx.journaling {
            self.ctx.journal.append(
                txn.start_ts(),
                &RecordPayload::Store {
                    tree: self.tree.handle,
                    key: key.encoded().to_vec(),
                    value: value.to_vec(),
                },
            )?;
        }

        let result = self.apply_write(key.encoded(), value, false, WriteAs::Tx(txn));
        if result.is_err() {
            // the journal already carries the SR; commit must not succeed
            txn.poison();
        }
        result
    }

    /// Fetch the value visible to `txn` at `key`.
    pub fn fetch(&self, txn: &Transaction, key: &Key) -> Result<Option<Vec<u8>>> {
        key.check_storable(self.ctx.max_key_size)?;
        txn.require_active()?;
        self.fetch_as_of(key.encoded(), txn.start_ts())
    }

    /// Remove `key` for `txn`. Returns whether a visible value existed.
    pub fn remove(&self, txn: &Transaction, key: &Key) -> Result<bool> {
        key.check_storable(self.ctx.max_key_size)?;
        txn.require_active()?;

        let existed = self.fetch_as_of(key.encoded(), txn.start_ts())?.is_some();

        if self.ctx.journaling {
            self.ctx.journal.append(
                txn.start_ts(),
                &RecordPayload::DeleteRange {
                    tree: self.tree.handle,
                    low: key.encoded().to_vec(),
                    high: key.encoded().to_vec(),
                },
            )?;
        }

        let result = self.apply_write(key.encoded(), &[], true, WriteAs::Tx(txn));
        if result.is_err() {
            txn.poison();
        }
        result?;
        Ok(existed)
    }

    /// Remove every visible key in `[low, high]`. Returns how many keys the
    /// transaction deleted.
    pub fn remove_range(&self, txn: &Transaction, low: &Key, high: &Key) -> Result<usize> {
        low.check_storable(self.ctx.max_key_size)?;
        high.check_storable(self.ctx.max_key_size)?;
        txn.require_active()?;

        if self.ctx.journaling {
            self.ctx.journal.append(
                txn.start_ts(),
                &RecordPayload::DeleteRange {
                    tree: self.tree.handle,
                    low: low.encoded().to_vec(),
                    high: high.encoded().to_vec(),
                },
            )?;
        }

        let mut removed = 0;
        let mut position = low.clone();
        let mut inclusive = true;
        loop {
            let dir = if inclusive { Direction::GtEq } else { Direction::Gt };
            let Some(found) = self.traverse(txn, &position, dir, true)? else {
                break;
            };
            if found.key > *high {
                break;
            }
            let result = self.apply_write(
                found.key.encoded(),
                &[],
                true,
                WriteAs::Tx(txn),
            );
            if result.is_err() {
                txn.poison();
            }
            result?;
            removed += 1;
            position = found.key;
            inclusive = false;
        }

        if removed > 0 {
            // once the deletes settle, sweep the tombstones out of the pages
            self.ctx.cleanup.enqueue(CleanupAction::RemoveAntivalues {
                volume: self.tree.volume,
                tree_root: self.tree.root,
                low: low.encoded().to_vec(),
                high: high.encoded().to_vec(),
            });
        }
        Ok(removed)
    }

    /// Seek the next key relative to `key` in `dir`. With `deep` unset the
    /// result is truncated to `key`'s depth, naming the sibling subtree
    /// instead of the key inside it.
    pub fn traverse(
        &self,
        txn: &Transaction,
        key: &Key,
        dir: Direction,
        deep: bool,
    ) -> Result<Option<TraverseResult>> {
        txn.require_active()?;
        self.traverse_as_of(key, dir, deep, txn.start_ts())
    }

    // ==================================================================
    // System-level entry points (recovery replay, directory, cleanup)
    // ==================================================================

    pub(crate) fn system_store(&self, key: &[u8], value: &[u8], ts: Timestamp) -> Result<()> {
        self.apply_write(key, value, false, WriteAs::System(ts))
    }

    pub(crate) fn system_fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // system reads see every settled version
        self.fetch_as_of(key, Timestamp::new(u64::MAX))
    }

    pub(crate) fn system_remove(&self, key: &[u8], ts: Timestamp) -> Result<()> {
        self.apply_write(key, &[], true, WriteAs::System(ts))
    }

    /// Physically remove every record in `[low, high]`; recovery replay of
    /// DR records.
    pub(crate) fn system_remove_range(&self, low: &[u8], high: &[u8], ts: Timestamp) -> Result<usize> {
        let mut removed = 0;
        let mut position = Key::from_encoded(low);
        let mut inclusive = true;
        loop {
            let dir = if inclusive { Direction::GtEq } else { Direction::Gt };
            let Some(found) = self.traverse_as_of(&position, dir, true, Timestamp::new(u64::MAX))?
            else {
                break;
            };
            if found.key.encoded() > high {
                break;
            }
            self.apply_write(found.key.encoded(), &[], true, WriteAs::System(ts))?;
            removed += 1;
            position = found.key;
            inclusive = false;
        }
        Ok(removed)
    }

    pub(crate) fn system_traverse(
        &self,
        key: &Key,
        dir: Direction,
        deep: bool,
    ) -> Result<Option<(Key, Option<Vec<u8>>)>> {
        Ok(self
            .traverse_as_of(key, dir, deep, Timestamp::new(u64::MAX))?
            .map(|r| (r.key, r.value)))
    }

    // ==================================================================
    // Fetch
    // ==================================================================

    fn fetch_as_of(&self, key: &[u8], as_of: Timestamp) -> Result<Option<Vec<u8>>> {
        let leaf = self.descend_read(key)?;
        let page = DataPage::new(&leaf);
        let Ok(slot) = page.search(key) else {
            return Ok(None);
        };
        self.resolve_value(page, slot, as_of)
    }

    /// Materialize the value at `slot` as seen by a reader at `as_of`.
    fn resolve_value(
        &self,
        page: DataPage<'_>,
        slot: usize,
        as_of: Timestamp,
    ) -> Result<Option<Vec<u8>>> {
        let value = page.value_at(slot);
        let raw = if value.long {
            let ptr = LongRecordPointer::from_bytes(value.bytes);
            self.read_long_value(ptr)?
        } else {
            value.bytes.to_vec()
        };
        if value.mvv || mvv::is_mvv(&raw) {
            Ok(mvv::visible(&raw, as_of, &self.resolver())?.map(|v| v.to_vec()))
        } else {
            Ok(Some(raw))
        }
    }

    /// Reader-claim crab walk from the root to the leaf owning `key`.
    fn descend_read(&self, key: &[u8]) -> Result<PageReadGuard<'_>> {
        let mut guard = self.ctx.pool.pin_read(&self.ctx.volume, self.tree.root)?;
        loop {
            let header_type = guard.header().page_type;
            match header_type {
                PageType::DataLeaf => return Ok(guard),
                PageType::DataInterior => {
                    let child = {
                        let page = DataPage::new(&guard);
                        if page.slot_count() == 0 {
                            return Err(Error::CorruptPage {
                                volume: self.tree.volume,
                                page: guard.page_addr(),
                            });
                        }
                        page.child_at(page.descend_slot(key))
                    };
                    let next = self.ctx.pool.pin_read(&self.ctx.volume, child)?;
                    guard = next; // parent claim released here
                }
                _ => {
                    return Err(Error::CorruptPage {
                        volume: self.tree.volume,
                        page: guard.page_addr(),
                    })
                }
            }
        }
    }

    // ==================================================================
    // Write path
    // ==================================================================

    /// Apply one logical write (store or antivalue/physical remove) to the
    /// tree.
    ///
    /// The fast path descends with reader claims and upgrades to a writer
    /// claim on the leaf; when the leaf turns out to need a split the
    /// operation retries with writer claims on the whole parent chain.
    fn apply_write(
        &self,
        key: &[u8],
        value: &[u8],
        antivalue: bool,
        writer: WriteAs<'_>,
    ) -> Result<()> {
        loop {
            let (_parent, mut leaf) = self.descend_leaf_write(key)?;
            match self.try_apply_on_leaf(&mut leaf, key, value, antivalue, writer)? {
                ApplyOutcome::Done => return Ok(()),
                ApplyOutcome::NeedsSplit => {}
            }
            drop(leaf);
            drop(_parent);

            // split under the full writer spine, then retry the fast path
            let mut path = self.descend_write_full(key)?;
            match self.try_apply_on_leaf(
                path.last_mut().expect("leaf claimed"),
                key,
                value,
                antivalue,
                writer,
            )? {
                ApplyOutcome::Done => return Ok(()),
                ApplyOutcome::NeedsSplit => {
                    self.split_leaf(&mut path, key)?;
                }
            }
        }
    }

    /// Fast write descent: reader crab-walk to the leaf's parent, then a
    /// writer claim on the leaf. The parent's reader claim is held while
    /// the leaf claim is acquired, which keeps any structure change away
    /// from the leaf (splits and joins claim the parent as a writer).
    fn descend_leaf_write(
        &self,
        key: &[u8],
    ) -> Result<(Option<PageReadGuard<'_>>, PageWriteGuard<'_>)> {
        let mut parent: Option<PageReadGuard<'_>> = None;
        let mut addr = self.tree.root;
        loop {
            let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
            match guard.header().page_type {
                PageType::DataLeaf => {
                    drop(guard);
                    let leaf = self.ctx.pool.pin_write(&self.ctx.volume, addr)?;
                    return Ok((parent, leaf));
                }
                PageType::DataInterior => {
                    let child = {
                        let page = DataPage::new(&guard);
                        if page.slot_count() == 0 {
                            return Err(Error::CorruptPage {
                                volume: self.tree.volume,
                                page: guard.page_addr(),
                            });
                        }
                        page.child_at(page.descend_slot(key))
                    };
                    parent = Some(guard); // previous parent claim drops here
                    addr = child;
                }
                _ => {
                    return Err(Error::CorruptPage {
                        volume: self.tree.volume,
                        page: guard.page_addr(),
                    })
                }
            }
        }
    }

    /// Split descent: writer claims on the whole root-to-leaf spine.
    fn descend_write_full(&self, key: &[u8]) -> Result<Vec<PageWriteGuard<'_>>> {
        let mut path: Vec<PageWriteGuard<'_>> = Vec::new();
        path.push(self.ctx.pool.pin_write(&self.ctx.volume, self.tree.root)?);
        loop {
            let last = path.last().expect("path nonempty");
            match last.header().page_type {
                PageType::DataLeaf => return Ok(path),
                PageType::DataInterior => {
                    let child = {
                        let page = DataPage::new(last);
                        if page.slot_count() == 0 {
                            return Err(Error::CorruptPage {
                                volume: self.tree.volume,
                                page: last.page_addr(),
                            });
                        }
                        page.child_at(page.descend_slot(key))
                    };
                    let next = self.ctx.pool.pin_write(&self.ctx.volume, child)?;
                    path.push(next);
                }
                _ => {
                    return Err(Error::CorruptPage {
                        volume: self.tree.volume,
                        page: last.page_addr(),
                    })
                }
            }
        }
    }

    /// Try the write against a claimed leaf.
    fn try_apply_on_leaf(
        &self,
        leaf: &mut PageWriteGuard<'_>,
        key: &[u8],
        value: &[u8],
        antivalue: bool,
        writer: WriteAs<'_>,
    ) -> Result<ApplyOutcome> {

        // decide the new record content
        let (slot, old) = {
            let page = DataPage::new(leaf);
            match page.search(key) {
                Ok(slot) => {
                    let value_ref = page.value_at(slot);
                    let raw = if value_ref.long {
                        let ptr = LongRecordPointer::from_bytes(value_ref.bytes);
                        Some((self.read_long_value(ptr)?, true, Some(ptr)))
                    } else {
                        Some((value_ref.bytes.to_vec(), value_ref.mvv, None))
                    };
                    (slot, raw)
                }
                Err(slot) => (slot, None),
            }
        };

        let old_chain = old.as_ref().and_then(|(_, _, ptr)| *ptr);
        let old_bytes = old.as_ref().map(|(bytes, _, _)| bytes.as_slice());

        let new_raw = match writer {
            WriteAs::System(_) => {
                if antivalue {
                    // physical removal
                    if old.is_some() {
                        DataPageMut::new(leaf).remove(slot);
                        let ts = self.write_timestamp(writer);
                        leaf.set_version(ts);
                        if let Some(ptr) = old_chain {
                            self.enqueue_chain_collect(ptr);
                        }
                    }
                    return Ok(ApplyOutcome::Done);
                }
                // escapes a leading MVV-marker byte in the user's bytes
                mvv::encode_primordial(value)
            }
            WriteAs::Tx(txn) => mvv::append_version(
                old_bytes,
                txn.start_ts(),
                antivalue,
                value,
                &self.resolver(),
            )?,
        };

        // pick inline or chained representation
        let inline_allowance =
            max_inline_record(self.ctx.pool.page_size()) - RECORD_OVERHEAD - key.len();
        let is_mvv_encoded = mvv::is_mvv(&new_raw);
        let (bytes, flags) = if new_raw.len() > inline_allowance {
            let ts = self.write_timestamp(writer);
            let ptr = self.write_long_value(&new_raw, ts)?;
            let mut flags = FLAG_LONG;
            if is_mvv_encoded {
                flags |= FLAG_MVV;
            }
            (ptr.to_bytes().to_vec(), flags)
        } else {
            let flags = if is_mvv_encoded { FLAG_MVV } else { 0 };
            (new_raw.clone(), flags)
        };

        // apply to the leaf, pruning in place before giving up
        let applied = {
            let mut page = DataPageMut::new(leaf);
            let ok = if old.is_some() {
                page.replace_value(slot, &bytes, flags)
            } else {
                page.insert(slot, key, &bytes, flags)
            };
            ok
        };
        let applied = if applied {
            true
        } else {
            self.prune_leaf_in_place(leaf)?;
            // the slot may have moved if pruning removed records
            let search_result = DataPage::new(leaf).search(key);
            let mut page = DataPageMut::new(leaf);
            match search_result {
                Ok(s) => page.replace_value(s, &bytes, flags),
                Err(s) => page.insert(s, key, &bytes, flags),
            }
        };

        if !applied {
            if flags & FLAG_LONG != 0 {
                // the freshly written chain is unreachable; reclaim it
                self.enqueue_chain_collect(LongRecordPointer::from_bytes(&bytes));
            }
            return Ok(ApplyOutcome::NeedsSplit);
        }

        let ts = self.write_timestamp(writer);
        leaf.set_version(ts);

        if let Some(ptr) = old_chain {
            self.enqueue_chain_collect(ptr);
        }
        if let WriteAs::Tx(txn) = writer {
            self.ctx.tx_index.note_version_written(txn.handle());
            if is_mvv_encoded && new_raw.len() > self.ctx.pool.page_size() / 8 {
                self.ctx.cleanup.enqueue(CleanupAction::PruneMvv {
                    volume: self.tree.volume,
                    page: leaf.page_addr(),
                });
            }
        }
        Ok(ApplyOutcome::Done)
    }

    fn write_timestamp(&self, writer: WriteAs<'_>) -> Timestamp {
        match writer {
            WriteAs::System(ts) => ts,
            WriteAs::Tx(_) => self.ctx.timestamps.next(),
        }
    }

    // ==================================================================
    // Split
    // ==================================================================

    /// Split the leaf at the end of `path`, propagating separators up the
    /// claimed spine (cascading as needed). The caller retries afterwards.
    fn split_leaf<'a>(&'a self, path: &mut Vec<PageWriteGuard<'a>>, key: &[u8]) -> Result<()> {
        let mut level = path.len() - 1;
        loop {
            if level == 0 {
                // splitting the root itself: grow downward so the root
                // address stays stable, then split the demoted copy
                self.demote_root(path)?;
                level = 1;
            }

            let insert_slot = {
                let page = DataPage::new(&path[level]);
                match page.search(key) {
                    Ok(s) | Err(s) => s,
                }
            };
            let (right_addr, separator) = {
                let guard = &mut path[level];
                let (right_addr, mut right_guard) = self.ctx.pool.new_page(&self.ctx.volume)?;
                let page_type = guard.header().page_type;
                let ts = self.ctx.timestamps.next();
                DataPageMut::init(&mut right_guard, page_type, ts);

                let sp = {
                    let left = DataPageMut::new(guard);
                    left.choose_split(self.tree_split_policy(), insert_slot)
                };
                let separator = {
                    let mut left = DataPageMut::new(guard);
                    let mut right = DataPageMut::new(&mut right_guard);
                    left.split_into(&mut right, sp)
                };

                // splice into the sibling chain
                right_guard.set_right_sibling(guard.right_sibling());
                guard.set_right_sibling(right_addr);
                right_guard.set_version(ts);
                guard.set_version(ts);
                (right_addr, separator)
            };
            trace!(
                "split {} at level {} -> new sibling {}",
                path[level].page_addr(),
                level,
                right_addr
            );

            // insert the separator into the parent
            debug_assert!(level >= 1, "root splits go through demote_root");
            let parent = &mut path[level - 1];
            let inserted = {
                let slot = match DataPage::new(parent).search(&separator) {
                    Ok(s) | Err(s) => s,
                };
                let mut page = DataPageMut::new(parent);
                page.insert(slot, &separator, &right_addr.0.to_be_bytes(), 0)
            };
            if inserted {
                let ts = self.ctx.timestamps.next();
                parent.set_version(ts);
                return Ok(());
            }
            // parent is full too: split it and retry the separator insert
            level -= 1;
        }
    }

    /// Root split with a stable root address: move everything into a fresh
    /// child and turn the root into an interior over it. The new child is
    /// spliced into the path at index 1, keeping the spine contiguous.
    fn demote_root<'a>(&'a self, path: &mut Vec<PageWriteGuard<'a>>) -> Result<()> {
        let ts = self.ctx.timestamps.next();

        let (child_addr, mut child_guard) = self.ctx.pool.new_page(&self.ctx.volume)?;
        {
            let root = &mut path[0];
            let root_type = root.header().page_type;
            DataPageMut::init(&mut child_guard, root_type, ts);
            {
                let root_read = DataPage::new(root);
                let mut child = DataPageMut::new(&mut child_guard);
                child.join_from(root_read);
            }
            child_guard.set_right_sibling(root.right_sibling());
            child_guard.set_version(ts);

            DataPageMut::init(root, PageType::DataInterior, ts);
            root.set_right_sibling(crate::common::PageAddress::NULL);
            {
                let mut root_mut = DataPageMut::new(root);
                let ok = root_mut.insert(0, b"", &child_addr.0.to_be_bytes(), 0);
                debug_assert!(ok);
            }
            root.set_version(ts);
        }
        path.insert(1, child_guard);
        Ok(())
    }

    fn tree_split_policy(&self) -> SplitPolicy {
        self.split_policy.get()
    }

    // ==================================================================
    // Long records
    // ==================================================================

    /// Largest value guaranteed to store inline next to `key`; one byte
    /// more goes to a long-record chain. Accounts for the framing of a
    /// single-version multi-version value, the shape a fresh transactional
    /// store takes.
    pub fn long_record_threshold(&self, key: &Key) -> usize {
        // marker byte plus one version header
        const VERSION_OVERHEAD: usize = 13;
        max_inline_record(self.ctx.pool.page_size())
            - RECORD_OVERHEAD
            - key.encoded().len()
            - VERSION_OVERHEAD
    }

    fn chain_capacity(&self) -> usize {
        self.ctx.pool.page_size() - PageHeader::SIZE
    }

    /// Write `bytes` as a chain of long-record pages; the head page stores
    /// the total length ahead of its data.
    fn write_long_value(&self, bytes: &[u8], ts: Timestamp) -> Result<LongRecordPointer> {
        let capacity = self.chain_capacity();
        let head_capacity = capacity - 8;

        let mut remaining = bytes;
        let mut chunks: Vec<&[u8]> = Vec::new();
        let first = remaining.len().min(head_capacity);
        chunks.push(&remaining[..first]);
        remaining = &remaining[first..];
        while !remaining.is_empty() {
            let n = remaining.len().min(capacity);
            chunks.push(&remaining[..n]);
            remaining = &remaining[n..];
        }

        let addrs: Vec<PageAddress> = (0..chunks.len())
            .map(|_| self.ctx.volume.allocate())
            .collect::<Result<_>>()?;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut guard = self.ctx.pool.pin_write(&self.ctx.volume, addrs[i])?;
            DataPageMut::init(&mut guard, PageType::LongRecord, ts);
            let next = addrs.get(i + 1).copied().unwrap_or(PageAddress::NULL);
            guard.set_right_sibling(next);
            let data = guard.as_mut_slice();
            let start = if i == 0 {
                data[PageHeader::SIZE..PageHeader::SIZE + 8]
                    .copy_from_slice(&(bytes.len() as u64).to_be_bytes());
                PageHeader::SIZE + 8
            } else {
                PageHeader::SIZE
            };
            data[start..start + chunk.len()].copy_from_slice(chunk);
            guard.set_version(ts);
        }

        Ok(LongRecordPointer {
            head: addrs[0],
            total_len: bytes.len() as u64,
        })
    }

    /// Read a long-record chain back into one buffer.
    fn read_long_value(&self, ptr: LongRecordPointer) -> Result<Vec<u8>> {
        let capacity = self.chain_capacity();
        let mut out = Vec::with_capacity(ptr.total_len as usize);
        let mut addr = ptr.head;
        let mut first = true;
        while !addr.is_null() && out.len() < ptr.total_len as usize {
            let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
            if guard.header().page_type != PageType::LongRecord {
                return Err(Error::CorruptPage {
                    volume: self.tree.volume,
                    page: addr,
                });
            }
            let data = guard.as_slice();
            let start = if first {
                PageHeader::SIZE + 8
            } else {
                PageHeader::SIZE
            };
            let available = if first { capacity - 8 } else { capacity };
            let want = (ptr.total_len as usize - out.len()).min(available);
            out.extend_from_slice(&data[start..start + want]);
            addr = guard.right_sibling();
            first = false;
        }
        if out.len() != ptr.total_len as usize {
            return Err(Error::CorruptPage {
                volume: self.tree.volume,
                page: ptr.head,
            });
        }
        Ok(out)
    }

    fn enqueue_chain_collect(&self, ptr: LongRecordPointer) {
        self.ctx.cleanup.enqueue(CleanupAction::CollectLongRecord {
            volume: self.tree.volume,
            head: ptr.head,
        });
    }

    /// Free every page of a chain immediately (cleanup executor).
    pub(crate) fn collect_long_chain(&self, head: PageAddress) -> Result<usize> {
        let ts = self.ctx.timestamps.next();
        let mut addr = head;
        let mut freed = 0;
        while !addr.is_null() {
            let next = {
                let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
                if guard.header().page_type != PageType::LongRecord {
                    break; // already reclaimed or repurposed
                }
                guard.right_sibling()
            };
            self.ctx.pool.invalidate((self.tree.volume, addr));
            self.ctx.volume.free(addr, ts)?;
            freed += 1;
            addr = next;
        }
        Ok(freed)
    }

    // ==================================================================
    // Traversal
    // ==================================================================

    fn traverse_as_of(
        &self,
        key: &Key,
        dir: Direction,
        deep: bool,
        as_of: Timestamp,
    ) -> Result<Option<TraverseResult>> {
        match dir {
            Direction::Eq => {
                key.check_storable(self.ctx.max_key_size)?;
                Ok(self.fetch_as_of(key.encoded(), as_of)?.map(|value| {
                    TraverseResult {
                        key: key.clone(),
                        value: Some(value),
                    }
                }))
            }
            Direction::Gt | Direction::GtEq => {
                let result = self.seek_forward(key, dir == Direction::GtEq, deep, as_of)?;
                self.finish_traverse(result, key, deep, as_of)
            }
            Direction::Lt | Direction::LtEq => {
                let result = self.seek_backward(key, dir == Direction::LtEq, as_of)?;
                self.finish_traverse(result, key, deep, as_of)
            }
        }
    }

    /// Shallow traversals report the sibling subtree, not the key inside
    /// it: truncate to the source depth and look the truncated key up.
    fn finish_traverse(
        &self,
        found: Option<(Key, Vec<u8>)>,
        source: &Key,
        deep: bool,
        as_of: Timestamp,
    ) -> Result<Option<TraverseResult>> {
        let Some((key, value)) = found else {
            return Ok(None);
        };
        let depth = source.depth();
        if deep || source.is_sentinel() || key.depth() <= depth {
            return Ok(Some(TraverseResult {
                key,
                value: Some(value),
            }));
        }
        let mut truncated = key;
        truncated.truncate_depth(depth);
        let value = self.fetch_as_of(truncated.encoded(), as_of)?;
        Ok(Some(TraverseResult {
            key: truncated,
            value,
        }))
    }

    /// Find the first visible key at or after the seek position.
    fn seek_forward(
        &self,
        key: &Key,
        inclusive: bool,
        deep: bool,
        as_of: Timestamp,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        if key.is_after() {
            return Ok(None);
        }
        let seed: Vec<u8> = if key.is_before() {
            Vec::new()
        } else if !deep && !inclusive {
            // skip the whole subtree below the source key
            key.next_sibling_seed()
        } else {
            key.encoded().to_vec()
        };

        let mut guard = self.descend_read(&seed)?;
        let mut slot = {
            let page = DataPage::new(&guard);
            match page.search(&seed) {
                Ok(s) => {
                    if inclusive || (!deep && !inclusive) {
                        s
                    } else {
                        s + 1
                    }
                }
                Err(s) => s,
            }
        };

        loop {
            let count = DataPage::new(&guard).slot_count();
            if slot >= count {
                let next = guard.right_sibling();
                if next.is_null() {
                    return Ok(None);
                }
                let next_guard = self.ctx.pool.pin_read(&self.ctx.volume, next)?;
                guard = next_guard;
                slot = 0;
                continue;
            }
            let page = DataPage::new(&guard);
            if let Some(value) = self.resolve_value(page, slot, as_of)? {
                let found = Key::from_encoded(page.key_at(slot));
                return Ok(Some((found, value)));
            }
            slot += 1;
        }
    }

    /// Find the last visible key strictly before (or at) the seek position.
    fn seek_backward(
        &self,
        key: &Key,
        inclusive: bool,
        as_of: Timestamp,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        if key.is_before() {
            return Ok(None);
        }

        if inclusive && !key.is_sentinel() {
            if let Some(value) = self.fetch_as_of(key.encoded(), as_of)? {
                return Ok(Some((key.clone(), value)));
            }
        }

        let bound: Option<&[u8]> = if key.is_after() {
            None
        } else {
            Some(key.encoded())
        };
        self.predecessor(self.tree.root, bound, as_of)
    }

    /// Largest visible key strictly below `bound` (or the largest at all
    /// when `bound` is `None`) within the subtree at `addr`.
    fn predecessor(
        &self,
        addr: PageAddress,
        bound: Option<&[u8]>,
        as_of: Timestamp,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
        match guard.header().page_type {
            PageType::DataLeaf => {
                let page = DataPage::new(&guard);
                let start = match bound {
                    None => page.slot_count(),
                    Some(bound) => match page.search(bound) {
                        Ok(s) | Err(s) => s,
                    },
                };
                for slot in (0..start).rev() {
                    if let Some(value) = self.resolve_value(page, slot, as_of)? {
                        let found = Key::from_encoded(page.key_at(slot));
                        return Ok(Some((found, value)));
                    }
                }
                Ok(None)
            }
            PageType::DataInterior => {
                let page = DataPage::new(&guard);
                let start = match bound {
                    None => page.slot_count(),
                    Some(bound) => match page.search(bound) {
                        Ok(s) => s + 1,
                        Err(s) => s,
                    },
                };
                // children at start.. cannot hold keys below the bound
                for slot in (0..start).rev() {
                    let child = page.child_at(slot);
                    // only the first visited child still needs the bound;
                    // everything further left is entirely below it
                    let child_bound = if slot + 1 == start { bound } else { None };
                    if let Some(found) =
                        self.predecessor(child, child_bound, as_of)?
                    {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
            _ => Err(Error::CorruptPage {
                volume: self.tree.volume,
                page: addr,
            }),
        }
    }

    // ==================================================================
    // Pruning and joins (cleanup entry points)
    // ==================================================================

    /// Prune every multi-version value on the claimed leaf. Returns whether
    /// anything changed.
    fn prune_leaf_in_place(&self, leaf: &mut PageWriteGuard<'_>) -> Result<bool> {
        let floor = self.ctx.tx_index.active_transaction_floor();
        let mut changed = false;
        let mut slot = 0;
        loop {
            let action = {
                let page = DataPage::new(leaf);
                if slot >= page.slot_count() {
                    None
                } else {
                    let value = page.value_at(slot);
                    if !value.mvv {
                        Some(PruneStep::Skip)
                    } else {
                        let raw = if value.long {
                            let ptr = LongRecordPointer::from_bytes(value.bytes);
                            self.read_long_value(ptr)?
                        } else {
                            value.bytes.to_vec()
                        };
                        let old_chain =
                            value.long.then(|| LongRecordPointer::from_bytes(value.bytes));
                        match mvv::prune(&raw, floor, &self.resolver())? {
                            Pruned::Unchanged => Some(PruneStep::Skip),
                            Pruned::Rewritten(bytes) => {
                                Some(PruneStep::Rewrite { raw, bytes, old_chain })
                            }
                            Pruned::Remove => Some(PruneStep::Remove { raw, old_chain }),
                        }
                    }
                }
            };

            let Some(action) = action else { break };
            match action {
                PruneStep::Skip => {
                    slot += 1;
                }
                PruneStep::Rewrite { raw, bytes, old_chain } => {
                    self.account_pruned(&raw, &bytes)?;
                    let is_mvv = mvv::is_mvv(&bytes);
                    let inline_allowance = max_inline_record(self.ctx.pool.page_size())
                        - RECORD_OVERHEAD
                        - DataPage::new(leaf).key_at(slot).len();
                    let (stored, flags) = if bytes.len() > inline_allowance {
                        let ts = self.ctx.timestamps.next();
                        let ptr = self.write_long_value(&bytes, ts)?;
                        let mut flags = FLAG_LONG;
                        if is_mvv {
                            flags |= FLAG_MVV;
                        }
                        (ptr.to_bytes().to_vec(), flags)
                    } else {
                        (bytes, if is_mvv { FLAG_MVV } else { 0 })
                    };
                    let ok = DataPageMut::new(leaf).replace_value(slot, &stored, flags);
                    if ok {
                        changed = true;
                        if let Some(ptr) = old_chain {
                            self.enqueue_chain_collect(ptr);
                        }
                    } else if flags & FLAG_LONG != 0 {
                        self.enqueue_chain_collect(LongRecordPointer::from_bytes(&stored));
                    }
                    slot += 1;
                }
                PruneStep::Remove { raw, old_chain } => {
                    self.account_pruned(&raw, &[])?;
                    DataPageMut::new(leaf).remove(slot);
                    if let Some(ptr) = old_chain {
                        self.enqueue_chain_collect(ptr);
                    }
                    changed = true;
                    // do not advance: the next record slid into this slot
                }
            }
        }
        Ok(changed)
    }

    /// Tell the index which writers' versions pruning settled.
    fn account_pruned(&self, before: &[u8], after: &[u8]) -> Result<()> {
        let old_writers: Vec<Timestamp> =
            mvv::decode(before)?.iter().map(|v| v.writer).collect();
        let new_writers: Vec<Timestamp> = if after.is_empty() {
            Vec::new()
        } else {
            mvv::decode(after)?.iter().map(|v| v.writer).collect()
        };
        for writer in old_writers {
            if writer != Timestamp::ZERO && !new_writers.contains(&writer) {
                self.ctx.tx_index.note_version_pruned(writer);
            }
        }
        Ok(())
    }

    /// Cleanup entry point: prune the MVVs of one page, then try a join if
    /// it ended up lightly filled.
    pub(crate) fn prune_page(&self, addr: PageAddress) -> Result<()> {
        let (changed, first_key, light) = {
            let mut guard = self.ctx.pool.pin_write(&self.ctx.volume, addr)?;
            if guard.header().page_type != PageType::DataLeaf {
                return Ok(()); // repurposed since it was enqueued
            }
            let changed = self.prune_leaf_in_place(&mut guard)?;
            if changed {
                let ts = self.ctx.timestamps.next();
                guard.set_version(ts);
            }
            let page = DataPage::new(&guard);
            let light = page.live_bytes() < (self.ctx.pool.page_size() - PageHeader::SIZE) / 3
                && !guard.right_sibling().is_null();
            let first_key = (page.slot_count() > 0).then(|| page.key_at(0).to_vec());
            (changed, first_key, light)
        };

        if changed && light {
            if let Some(first_key) = first_key {
                self.try_join(&first_key)?;
            }
        }
        Ok(())
    }

    /// Prune every leaf overlapping `[low, high]`; the antivalue-removal
    /// cleanup action.
    pub(crate) fn prune_range(&self, low: &[u8], high: &[u8]) -> Result<()> {
        let mut addr = {
            let leaf = self.descend_read(low)?;
            leaf.page_addr()
        };
        loop {
            self.prune_page(addr)?;
            let next = {
                let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
                if guard.header().page_type != PageType::DataLeaf {
                    break;
                }
                let page = DataPage::new(&guard);
                if page.slot_count() > 0 && page.key_at(0) > high {
                    break;
                }
                guard.right_sibling()
            };
            if next.is_null() {
                break;
            }
            addr = next;
        }
        Ok(())
    }

    /// Opportunistic join: writer claims on the page owning `key`, its
    /// right sibling, and their shared parent; merge if both halves fit.
    pub(crate) fn try_join(&self, key: &[u8]) -> Result<()> {
        let mut path = self.descend_write_full(key)?;
        if path.len() < 2 {
            return Ok(()); // the root has no sibling to join with
        }
        let leaf_level = path.len() - 1;
        self.join_level(&mut path, leaf_level)?;
        Ok(())
    }

    /// Merge `path[level]` with its right sibling when both fit into one
    /// page; cascades one level up when the parent becomes light.
    fn join_level(&self, path: &mut Vec<PageWriteGuard<'_>>, level: usize) -> Result<()> {
        if level == 0 {
            return Ok(());
        }
        let right_addr = path[level].right_sibling();
        if right_addr.is_null() {
            return Ok(());
        }

        // the sibling must hang off the same parent, one slot to the right
        let (parent_slot, sibling_slot_child) = {
            let parent = DataPage::new(&path[level - 1]);
            let slot = {
                let left_addr = path[level].page_addr();
                (0..parent.slot_count()).find(|&s| parent.child_at(s) == left_addr)
            };
            let Some(slot) = slot else { return Ok(()) };
            if slot + 1 >= parent.slot_count() {
                return Ok(()); // rightmost child under this parent
            }
            (slot, parent.child_at(slot + 1))
        };
        if sibling_slot_child != right_addr {
            return Ok(());
        }

        let right_guard = self.ctx.pool.pin_write(&self.ctx.volume, right_addr)?;
        {
            let left = DataPage::new(&path[level]);
            let right = DataPage::new(&right_guard);
            if !can_join(left, right, self.ctx.pool.page_size()) {
                return Ok(());
            }
        }

        let ts = self.ctx.timestamps.next();
        {
            let right = DataPage::new(&right_guard);
            let guard = &mut path[level];
            let mut left = DataPageMut::new(guard);
            left.join_from(right);
        }
        path[level].set_right_sibling(right_guard.right_sibling());
        path[level].set_version(ts);
        {
            let parent = &mut path[level - 1];
            DataPageMut::new(parent).remove(parent_slot + 1);
            parent.set_version(ts);
        }
        drop(right_guard);
        self.ctx.pool.invalidate((self.tree.volume, right_addr));
        self.ctx.volume.free(right_addr, ts)?;
        trace!("joined {} into {}", right_addr, path[level].page_addr());

        // a light parent can ripple one more join upward
        let parent_light = {
            let parent = DataPage::new(&path[level - 1]);
            parent.live_bytes() < (self.ctx.pool.page_size() - PageHeader::SIZE) / 3
        };
        if parent_light {
            self.join_level(path, level - 1)?;
        }
        Ok(())
    }

    // ==================================================================
    // Whole-tree operations
    // ==================================================================

    /// Every page of this tree (structure pages plus long-record chains),
    /// children before parents.
    pub(crate) fn collect_tree_pages(&self) -> Result<Vec<PageAddress>> {
        let mut pages = Vec::new();
        self.collect_subtree(self.tree.root, &mut pages)?;
        Ok(pages)
    }

    fn collect_subtree(&self, addr: PageAddress, out: &mut Vec<PageAddress>) -> Result<()> {
        let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
        match guard.header().page_type {
            PageType::DataInterior => {
                let children: Vec<PageAddress> = {
                    let page = DataPage::new(&guard);
                    (0..page.slot_count()).map(|s| page.child_at(s)).collect()
                };
                drop(guard);
                for child in children {
                    self.collect_subtree(child, out)?;
                }
            }
            PageType::DataLeaf => {
                let chains: Vec<PageAddress> = {
                    let page = DataPage::new(&guard);
                    (0..page.slot_count())
                        .filter(|&s| page.value_at(s).long)
                        .map(|s| LongRecordPointer::from_bytes(page.value_at(s).bytes).head)
                        .collect()
                };
                drop(guard);
                for head in chains {
                    let mut chain_addr = head;
                    while !chain_addr.is_null() {
                        let next = {
                            let link = self.ctx.pool.pin_read(&self.ctx.volume, chain_addr)?;
                            if link.header().page_type != PageType::LongRecord {
                                break;
                            }
                            link.right_sibling()
                        };
                        out.push(chain_addr);
                        chain_addr = next;
                    }
                }
            }
            _ => {}
        }
        out.push(addr);
        Ok(())
    }

    /// Structural check of the whole tree: key order within pages, sibling
    /// chain order, interior separators matching child minimums. Used by
    /// the cleanup manager after recovery.
    pub(crate) fn verify(&self) -> Result<()> {
        self.verify_subtree(self.tree.root, None)?;
        Ok(())
    }

    fn verify_subtree(&self, addr: PageAddress, min_key: Option<Vec<u8>>) -> Result<()> {
        let corrupt = || Error::CorruptPage {
            volume: self.tree.volume,
            page: addr,
        };
        let guard = self.ctx.pool.pin_read(&self.ctx.volume, addr)?;
        let page = DataPage::new(&guard);

        // keys strictly ascending within the page
        for slot in 1..page.slot_count() {
            if page.key_at(slot - 1) >= page.key_at(slot) {
                return Err(corrupt());
            }
        }
        if let (Some(min), true) = (min_key.as_deref(), page.slot_count() > 0) {
            if page.key_at(0) < min && !min.is_empty() {
                return Err(corrupt());
            }
        }

        if guard.header().page_type == PageType::DataInterior {
            if page.slot_count() == 0 {
                return Err(corrupt());
            }
            let children: Vec<(Vec<u8>, PageAddress)> = (0..page.slot_count())
                .map(|s| (page.key_at(s).to_vec(), page.child_at(s)))
                .collect();
            drop(guard);
            for (min, child) in children {
                self.verify_subtree(child, Some(min))?;
            }
        }
        Ok(())
    }
}

enum PruneStep {
    Skip,
    Rewrite {
        raw: Vec<u8>,
        bytes: Vec<u8>,
        old_chain: Option<LongRecordPointer>,
    },
    Remove {
        raw: Vec<u8>,
        old_chain: Option<LongRecordPointer>,
    },
}

enum ApplyOutcome {
    Done,
    NeedsSplit,
}
