//! Transaction lifecycle and commit policies.
//!
//! A [`Transaction`] is begun through the root object, which journals its
//! TS record and registers it with the transaction index. Writes made
//! through cursors tag MVV versions with the transaction's start timestamp;
//! commit draws the commit timestamp, journals the TC record, and waits for
//! durability according to the configured [`CommitPolicy`].
//!
//! Rollback is an ordinary outcome, not an exception path: a write-write
//! conflict poisons the transaction, the conflicting operation returns
//! [`Error::Rollback`], and so does any later commit attempt. No journal
//! record marks an abort - a TS without a TC is not committed, which is
//! exactly what recovery needs to know.
//!
//! A transaction is owned by the thread that began it (`!Send`); dropping
//! one that is still active rolls it back.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;

use crate::common::config::CommitPolicy;
use crate::common::{Error, Result, Timestamp, TimestampSource};
use crate::journal::record::RecordPayload;
use crate::journal::JournalManager;
use crate::mvcc::{TransactionIndex, TxHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    journal: Arc<JournalManager>,
    tx_index: Arc<TransactionIndex>,
    timestamps: Arc<TimestampSource>,
    policy: CommitPolicy,
    handle: TxHandle,
    state: Cell<TxState>,
    rollback_only: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    /// Begin a transaction: draw the start timestamp, journal TS, register
    /// with the index. Called by the root object.
    pub(crate) fn begin(
        journal: Arc<JournalManager>,
        tx_index: Arc<TransactionIndex>,
        timestamps: Arc<TimestampSource>,
        policy: CommitPolicy,
    ) -> Result<Transaction> {
        let start_ts = timestamps.next();
        let ts_addr = journal.append(start_ts, &RecordPayload::TxStart)?;
        let handle = tx_index.begin(start_ts, ts_addr)?;

        Ok(Transaction {
            journal,
            tx_index,
            timestamps,
            policy,
            handle,
            state: Cell::new(TxState::Active),
            rollback_only: Cell::new(false),
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub fn start_ts(&self) -> Timestamp {
        self.handle.start_ts
    }

    #[inline]
    pub(crate) fn handle(&self) -> TxHandle {
        self.handle
    }

    /// Fails with the transaction-state taxonomy when this handle has
    /// already committed or rolled back.
    pub(crate) fn require_active(&self) -> Result<()> {
        match self.state.get() {
            TxState::Active => Ok(()),
            _ => Err(Error::NoActiveTransaction),
        }
    }

    /// Mark the transaction rollback-only (write-write conflict, or a
    /// failed operation whose journal record must not take effect).
    pub(crate) fn poison(&self) {
        self.rollback_only.set(true);
    }

    /// Whether commit is doomed to the rollback outcome.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.get()
    }

    /// Commit. Returns [`Error::Rollback`] (after rolling back) when the
    /// transaction was poisoned by a conflict.
    pub fn commit(&mut self) -> Result<()> {
        self.require_active()?;
        if self.rollback_only.get() {
            self.rollback_internal();
            return Err(Error::Rollback);
        }

        let commit_ts = self.timestamps.next();
        let tc_addr = self.journal.append(
            self.start_ts(),
            &RecordPayload::TxCommit { commit_ts },
        )?;

        match self.policy {
            CommitPolicy::Hard => self.journal.force()?,
            CommitPolicy::Group => self.journal.wait_durable(tc_addr.checked_add(1)),
            CommitPolicy::Soft => {}
        }

        self.tx_index.commit(self.handle, commit_ts);
        self.state.set(TxState::Committed);
        Ok(())
    }

    /// Roll back explicitly.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_active()?;
        self.rollback_internal();
        Ok(())
    }

    fn rollback_internal(&self) {
        self.tx_index.abort(self.handle);
        self.state.set(TxState::RolledBack);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.get() == TxState::Active {
            warn!(
                "transaction {} dropped while active; rolling back",
                self.start_ts()
            );
            self.rollback_internal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalPositions;
    use tempfile::tempdir;

    fn deps(
        dir: &std::path::Path,
    ) -> (
        Arc<JournalManager>,
        Arc<TransactionIndex>,
        Arc<TimestampSource>,
    ) {
        let journal = Arc::new(
            JournalManager::open(&dir.join("j"), 10_000_000, JournalPositions::default()).unwrap(),
        );
        (
            journal,
            Arc::new(TransactionIndex::new(100)),
            Arc::new(TimestampSource::new()),
        )
    }

    fn begin(
        journal: &Arc<JournalManager>,
        index: &Arc<TransactionIndex>,
        ts: &Arc<TimestampSource>,
        policy: CommitPolicy,
    ) -> Transaction {
        Transaction::begin(
            Arc::clone(journal),
            Arc::clone(index),
            Arc::clone(ts),
            policy,
        )
        .unwrap()
    }

    #[test]
    fn test_commit_orders_timestamps() {
        let dir = tempdir().unwrap();
        let (journal, index, ts) = deps(dir.path());

        let mut txn = begin(&journal, &index, &ts, CommitPolicy::Hard);
        let start = txn.start_ts();
        txn.commit().unwrap();

        match index.disposition(start) {
            crate::mvcc::Disposition::Committed(commit) => assert!(commit > start),
            other => panic!("expected committed, got {:?}", other),
        }
        // hard policy left everything durable
        assert!(journal.durable_address() >= journal.current_address());
    }

    #[test]
    fn test_commit_after_rollback_is_state_error() {
        let dir = tempdir().unwrap();
        let (journal, index, ts) = deps(dir.path());

        let mut txn = begin(&journal, &index, &ts, CommitPolicy::Soft);
        txn.rollback().unwrap();
        assert!(matches!(txn.commit(), Err(Error::NoActiveTransaction)));
        assert!(matches!(txn.rollback(), Err(Error::NoActiveTransaction)));
    }

    #[test]
    fn test_poisoned_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let (journal, index, ts) = deps(dir.path());

        let mut txn = begin(&journal, &index, &ts, CommitPolicy::Soft);
        let start = txn.start_ts();
        txn.poison();
        assert!(matches!(txn.commit(), Err(Error::Rollback)));
        assert_eq!(index.disposition(start), crate::mvcc::Disposition::Aborted);
    }

    #[test]
    fn test_drop_while_active_rolls_back() {
        let dir = tempdir().unwrap();
        let (journal, index, ts) = deps(dir.path());

        let start = {
            let txn = begin(&journal, &index, &ts, CommitPolicy::Soft);
            txn.start_ts()
        };
        assert_eq!(index.disposition(start), crate::mvcc::Disposition::Aborted);
    }
}
