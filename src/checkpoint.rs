//! The checkpoint manager.
//!
//! A checkpoint proposes a timestamp `ct`, waits until every transaction
//! that began before `ct` has committed or rolled back, copies every dirty
//! buffer back to its volume, and only then writes the CP record - the
//! keystone recovery will replay from. The CP record carries the base
//! address (bounded by the proposal-time journal position and the oldest
//! still-active transaction's TS record), so nothing replay could need is
//! ever deleted ahead of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::alert::{AlertLevel, AlertMonitor};
use crate::buffer::BufferPool;
use crate::common::{Result, Timestamp, TimestampSource, VolumeHandle};
use crate::journal::record::RecordPayload;
use crate::journal::JournalManager;
use crate::mvcc::TransactionIndex;
use crate::storage::Volume;

/// Poll step while waiting for straggler transactions.
const CONFIRM_POLL: Duration = Duration::from_millis(5);

pub struct CheckpointManager {
    journal: Arc<JournalManager>,
    pools: Vec<Arc<BufferPool>>,
    volumes: HashMap<VolumeHandle, Arc<Volume>>,
    tx_index: Arc<TransactionIndex>,
    timestamps: Arc<TimestampSource>,
    alert: Arc<AlertMonitor>,
    append_only: bool,
    last_checkpoint_ts: AtomicU64,
}

impl CheckpointManager {
    pub fn new(
        journal: Arc<JournalManager>,
        pools: Vec<Arc<BufferPool>>,
        volumes: HashMap<VolumeHandle, Arc<Volume>>,
        tx_index: Arc<TransactionIndex>,
        timestamps: Arc<TimestampSource>,
        alert: Arc<AlertMonitor>,
        append_only: bool,
    ) -> Self {
        Self {
            journal,
            pools,
            volumes,
            tx_index,
            timestamps,
            alert,
            append_only,
            last_checkpoint_ts: AtomicU64::new(0),
        }
    }

    pub fn last_checkpoint_ts(&self) -> Timestamp {
        Timestamp::new(self.last_checkpoint_ts.load(Ordering::Acquire))
    }

    /// Propose, confirm, and write one checkpoint. `give_up` lets the
    /// caller abandon the confirmation wait (shutdown, grace period).
    /// Returns the checkpoint timestamp, or `None` when abandoned.
    pub fn checkpoint(&self, give_up: &dyn Fn() -> bool) -> Result<Option<Timestamp>> {
        let ct = self.timestamps.next();
        let proposal_addr = self.journal.current_address();
        debug!("checkpoint {} proposed at {}", ct, proposal_addr);

        // confirmation barrier: every transaction below ct has finished
        while !self.tx_index.all_before_finished(ct) {
            if give_up() {
                debug!("checkpoint {} abandoned", ct);
                return Ok(None);
            }
            std::thread::sleep(CONFIRM_POLL);
        }

        // copy-back: every dirty buffer reaches its volume (journal image
        // first, through the pool's write-back hook)
        if !self.append_only {
            for pool in &self.pools {
                for key in pool.dirty_keys(None) {
                    if let Err(e) = pool.write_back_page(key) {
                        self.alert
                            .report(AlertLevel::Error, "checkpoint", &format!("{}", e));
                        return Err(e);
                    }
                }
            }
            // the journal must be durable before any volume is
            self.journal.force()?;
            for volume in self.volumes.values() {
                volume.write_head()?;
                volume.sync()?;
            }
        }

        // the base address nothing before this checkpoint can need anymore
        let mut base = proposal_addr;
        if let Some(addr) = self.tx_index.oldest_active_ts_addr() {
            base = base.min(addr);
        }

        let active = self.tx_index.active_transactions();
        let cp_addr = self.journal.append(
            ct,
            &RecordPayload::Checkpoint {
                base_address: base,
                active,
            },
        )?;
        self.journal.force()?;
        self.journal.note_checkpoint(cp_addr, ct, base);
        if !self.append_only {
            self.journal.advance_base(base);
        }

        self.last_checkpoint_ts.store(ct.0, Ordering::Release);
        self.alert
            .report(AlertLevel::Normal, "checkpoint", "checkpoint confirmed");
        info!("checkpoint {} confirmed, keystone {}", ct, cp_addr);
        Ok(Some(ct))
    }
}
