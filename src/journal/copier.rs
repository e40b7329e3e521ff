//! The journal copier.
//!
//! Periodically writes dirty buffer-pool pages back to their volumes (each
//! write-back journals the page image first, through the pool's hook) and
//! advances the journal base address once everything the newest checkpoint
//! still needed has been copied. Journal files that fall wholly below the
//! base are deleted by the manager.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::alert::{AlertLevel, AlertMonitor};
use crate::buffer::BufferPool;
use crate::common::VolumeHandle;
use crate::journal::manager::JournalManager;
use crate::mvcc::TransactionIndex;
use crate::storage::Volume;

pub struct Copier {
    journal: Arc<JournalManager>,
    pools: Vec<Arc<BufferPool>>,
    volumes: HashMap<VolumeHandle, Arc<Volume>>,
    tx_index: Arc<TransactionIndex>,
    alert: Arc<AlertMonitor>,
    /// Copy-back suppressed: pages are only written at eviction pressure
    /// and the base address never advances.
    append_only: bool,
}

impl Copier {
    pub fn new(
        journal: Arc<JournalManager>,
        pools: Vec<Arc<BufferPool>>,
        volumes: HashMap<VolumeHandle, Arc<Volume>>,
        tx_index: Arc<TransactionIndex>,
        alert: Arc<AlertMonitor>,
        append_only: bool,
    ) -> Self {
        Self {
            journal,
            pools,
            volumes,
            tx_index,
            alert,
            append_only,
        }
    }

    /// One copier cycle: write dirty pages back, sync volumes, advance the
    /// base. Failed writes raise an alert and are retried next cycle.
    pub fn run_once(&self) {
        if self.append_only {
            return;
        }

        let mut wrote = 0usize;
        for pool in &self.pools {
            for key in pool.dirty_keys(None) {
                match pool.write_back_page(key) {
                    Ok(true) => wrote += 1,
                    Ok(false) => {}
                    Err(e) => {
                        self.alert
                            .report(AlertLevel::Error, "copier", &format!("{}", e));
                    }
                }
            }
        }

        if wrote > 0 {
            debug!("copier wrote {} pages", wrote);
            // journal first: a volume must never be durable ahead of it
            if let Err(e) = self.journal.force() {
                self.alert
                    .report(AlertLevel::Error, "copier", &format!("{}", e));
                return;
            }
            for volume in self.volumes.values() {
                if let Err(e) = volume.sync() {
                    self.alert
                        .report(AlertLevel::Error, "copier", &format!("{}", e));
                }
            }
        }

        self.advance_base();
    }

    /// Advance the base to the newest checkpoint's base address, bounded by
    /// anything a dirty buffer or live transaction still references.
    pub fn advance_base(&self) {
        if self.append_only {
            return;
        }
        let mut base = self.journal.checkpoint_base();
        if base.0 == 0 {
            return; // no confirmed checkpoint yet
        }
        if let Some(addr) = self.tx_index.oldest_active_ts_addr() {
            base = base.min(addr);
        }
        for pool in &self.pools {
            if let Some(addr) = pool.min_dirty_journal_addr() {
                base = base.min(addr);
            }
        }
        self.journal.advance_base(base);
    }
}
