//! The journal manager: an append-only record stream across rolled files.
//!
//! Files are named `<prefix>.<12-digit-decimal-base-address>`; the journal
//! as a whole is addressed by a monotonically increasing 64-bit byte offset
//! spanning rollovers, so `address - file_start` is the offset within the
//! file that owns the address. A record never spans files: when the active
//! file cannot hold the next record it is synced and a new file opens with
//! a JH record at its front.
//!
//! Three addresses steer the rest of the engine:
//! - **current** - the next byte to be written;
//! - **keystone** - the address of the most recent complete checkpoint
//!   record (recovery replays after it);
//! - **base** - the earliest address still needed by any dirty buffer or
//!   live transaction. Files wholly below the base are deleted.
//!
//! Appends stage into an in-memory buffer; [`JournalManager::force`] makes
//! everything appended so far durable and wakes commit waiters.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{Error, JournalAddress, Result, Timestamp};
use crate::journal::record::{self, RecordPayload, JOURNAL_VERSION};

/// Stage this many buffered bytes before an implicit flush to the file.
const WRITE_BUFFER_LIMIT: usize = 1 << 20;

/// Positions handed over by recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalPositions {
    pub current: JournalAddress,
    pub base: JournalAddress,
    pub keystone: JournalAddress,
    pub keystone_ts: Timestamp,
}

/// Snapshot of the journal's addresses and file count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    pub current_address: JournalAddress,
    pub durable_address: JournalAddress,
    pub base_address: JournalAddress,
    pub keystone_address: JournalAddress,
    pub file_count: usize,
}

struct Inner {
    file: File,
    file_start: u64,
    /// Bytes already written (not necessarily synced) to the file.
    file_len: u64,
    write_buffer: Vec<u8>,
    current_address: u64,
}

pub struct JournalManager {
    dir: PathBuf,
    file_prefix: String,
    block_size: u64,
    inner: Mutex<Inner>,
    durable: AtomicU64,
    base: AtomicU64,
    keystone: AtomicU64,
    keystone_ts: AtomicU64,
    /// Base address recorded in the newest CP record; how far the copier
    /// may advance the live base once copy-back has caught up.
    checkpoint_base: AtomicU64,
    file_count: AtomicUsize,
    durable_cond: Condvar,
    durable_mutex: Mutex<()>,
}

/// List the journal files under `prefix`, sorted by starting address.
pub fn list_journal_files(prefix: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir = prefix.parent().unwrap_or_else(|| Path::new("."));
    let stem = prefix
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("bad journal prefix {:?}", prefix)))?;

    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name
            .strip_prefix(stem)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if suffix.len() == 12 {
            if let Ok(start) = suffix.parse::<u64>() {
                files.push((start, entry.path()));
            }
        }
    }
    files.sort_unstable();
    Ok(files)
}

fn file_path_for(prefix: &Path, start: u64) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{:012}", start));
    prefix.with_file_name(name)
}

impl JournalManager {
    /// Open the journal for appending, continuing at the positions recovery
    /// validated (all zero on a fresh start).
    pub fn open(prefix: &Path, block_size: u64, positions: JournalPositions) -> Result<Self> {
        let dir = prefix
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file_prefix = prefix
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("bad journal prefix {:?}", prefix)))?
            .to_string();

        let files = list_journal_files(prefix)?;
        let current = positions.current.0;

        let manager = if let Some(&(file_start, ref path)) = files
            .iter()
            .rev()
            .find(|(start, _)| *start <= current)
            .filter(|_| current > 0)
        {
            // continue in the file that owns the validated end; truncate the
            // tail recovery rejected
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let valid_len = current - file_start;
            file.set_len(valid_len)?;

            Self {
                dir,
                file_prefix,
                block_size,
                inner: Mutex::new(Inner {
                    file,
                    file_start,
                    file_len: valid_len,
                    write_buffer: Vec::new(),
                    current_address: current,
                }),
                durable: AtomicU64::new(current),
                base: AtomicU64::new(positions.base.0),
                keystone: AtomicU64::new(positions.keystone.0),
                keystone_ts: AtomicU64::new(positions.keystone_ts.0),
                checkpoint_base: AtomicU64::new(positions.base.0),
                file_count: AtomicUsize::new(files.len()),
                durable_cond: Condvar::new(),
                durable_mutex: Mutex::new(()),
            }
        } else {
            // fresh journal
            let path = file_path_for(prefix, 0);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;

            let manager = Self {
                dir,
                file_prefix,
                block_size,
                inner: Mutex::new(Inner {
                    file,
                    file_start: 0,
                    file_len: 0,
                    write_buffer: Vec::new(),
                    current_address: 0,
                }),
                durable: AtomicU64::new(0),
                base: AtomicU64::new(0),
                keystone: AtomicU64::new(0),
                keystone_ts: AtomicU64::new(0),
                checkpoint_base: AtomicU64::new(0),
                file_count: AtomicUsize::new(1),
                durable_cond: Condvar::new(),
                durable_mutex: Mutex::new(()),
            };
            manager.append(
                Timestamp::ZERO,
                &RecordPayload::JournalHeader {
                    version: JOURNAL_VERSION,
                    block_size,
                    base_address: JournalAddress::ZERO,
                    file_start: JournalAddress::ZERO,
                },
            )?;
            manager
        };

        Ok(manager)
    }

    fn prefix_path(&self) -> PathBuf {
        self.dir.join(&self.file_prefix)
    }

    // ------------------------------------------------------------------
    // Append path
    // ------------------------------------------------------------------

    /// Append a record; returns its journal address. The record is staged
    /// in the write buffer and becomes durable at the next force.
    pub fn append(&self, timestamp: Timestamp, payload: &RecordPayload) -> Result<JournalAddress> {
        let bytes = record::encode(timestamp, payload);
        let mut inner = self.inner.lock();

        let in_file = inner.file_len + inner.write_buffer.len() as u64;
        if in_file + bytes.len() as u64 > self.block_size && in_file > 0 {
            self.rollover(&mut inner)?;
        }

        let addr = JournalAddress::new(inner.current_address);
        inner.write_buffer.extend_from_slice(&bytes);
        inner.current_address += bytes.len() as u64;

        if inner.write_buffer.len() >= WRITE_BUFFER_LIMIT {
            Self::flush_locked(&mut inner)?;
        }
        Ok(addr)
    }

    /// Start a new journal file at the current address.
    fn rollover(&self, inner: &mut Inner) -> Result<()> {
        Self::flush_locked(inner)?;
        inner.file.sync_all()?;
        self.durable
            .fetch_max(inner.current_address, Ordering::AcqRel);

        let new_start = inner.current_address;
        let path = file_path_for(&self.prefix_path(), new_start);
        debug!("journal rollover to {:?}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        inner.file = file;
        inner.file_start = new_start;
        inner.file_len = 0;
        self.file_count.fetch_add(1, Ordering::Relaxed);

        let header = record::encode(
            Timestamp::ZERO,
            &RecordPayload::JournalHeader {
                version: JOURNAL_VERSION,
                block_size: self.block_size,
                base_address: self.base_address(),
                file_start: JournalAddress::new(new_start),
            },
        );
        inner.write_buffer.extend_from_slice(&header);
        inner.current_address += header.len() as u64;
        Ok(())
    }

    fn flush_locked(inner: &mut Inner) -> Result<()> {
        if inner.write_buffer.is_empty() {
            return Ok(());
        }
        inner.file.write_all(&inner.write_buffer)?;
        inner.file_len += inner.write_buffer.len() as u64;
        inner.write_buffer.clear();
        Ok(())
    }

    /// Write buffered records to the file without syncing.
    pub fn flush(&self) -> Result<()> {
        Self::flush_locked(&mut self.inner.lock())
    }

    /// Make every appended record durable; wakes commit waiters.
    pub fn force(&self) -> Result<()> {
        let synced_to = {
            let mut inner = self.inner.lock();
            Self::flush_locked(&mut inner)?;
            inner.file.sync_all()?;
            inner.current_address
        };
        self.durable.fetch_max(synced_to, Ordering::AcqRel);
        let _lock = self.durable_mutex.lock();
        self.durable_cond.notify_all();
        Ok(())
    }

    /// Block until everything at or below `addr` is durable. The flusher's
    /// periodic force bounds the wait; `group` commits ride on it.
    pub fn wait_durable(&self, addr: JournalAddress) {
        loop {
            if self.durable.load(Ordering::Acquire) >= addr.0 {
                return;
            }
            let mut lock = self.durable_mutex.lock();
            if self.durable.load(Ordering::Acquire) >= addr.0 {
                return;
            }
            self.durable_cond
                .wait_for(&mut lock, Duration::from_millis(50));
        }
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    pub fn current_address(&self) -> JournalAddress {
        JournalAddress::new(self.inner.lock().current_address)
    }

    pub fn durable_address(&self) -> JournalAddress {
        JournalAddress::new(self.durable.load(Ordering::Acquire))
    }

    pub fn base_address(&self) -> JournalAddress {
        JournalAddress::new(self.base.load(Ordering::Acquire))
    }

    pub fn keystone_address(&self) -> JournalAddress {
        JournalAddress::new(self.keystone.load(Ordering::Acquire))
    }

    pub fn keystone_timestamp(&self) -> Timestamp {
        Timestamp::new(self.keystone_ts.load(Ordering::Acquire))
    }

    pub fn file_count(&self) -> usize {
        self.file_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            current_address: self.current_address(),
            durable_address: self.durable_address(),
            base_address: self.base_address(),
            keystone_address: self.keystone_address(),
            file_count: self.file_count(),
        }
    }

    /// Record a confirmed checkpoint and the base address its CP record
    /// carries.
    pub fn note_checkpoint(&self, keystone: JournalAddress, ts: Timestamp, base: JournalAddress) {
        self.keystone.store(keystone.0, Ordering::Release);
        self.keystone_ts.store(ts.0, Ordering::Release);
        self.checkpoint_base.store(base.0, Ordering::Release);
    }

    /// Base address of the newest confirmed checkpoint.
    pub fn checkpoint_base(&self) -> JournalAddress {
        JournalAddress::new(self.checkpoint_base.load(Ordering::Acquire))
    }

    /// Advance the base address (never backwards) and delete journal files
    /// that fell wholly below it.
    pub fn advance_base(&self, base: JournalAddress) {
        let prev = self.base.fetch_max(base.0, Ordering::AcqRel);
        if prev < base.0 {
            debug!("journal base advanced to {}", base);
            if let Err(e) = self.prune_files() {
                warn!("journal file pruning failed: {}", e);
            }
        }
    }

    /// Delete files whose entire address range lies below the base. A file
    /// is deletable when the next file starts at or below the base.
    fn prune_files(&self) -> Result<()> {
        let base = self.base.load(Ordering::Acquire);
        let files = list_journal_files(&self.prefix_path())?;
        for window in files.windows(2) {
            let path = &window[0].1;
            let next_start = window[1].0;
            if next_start <= base {
                debug!("deleting journal file {:?}", path);
                std::fs::remove_file(path)?;
                self.file_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// How hard admission control should lean on new transactions:
    /// the number of journal files beyond the urgent threshold.
    pub fn urgency(&self, urgent_threshold: usize) -> usize {
        self.file_count().saturating_sub(urgent_threshold)
    }
}
