//! The cleanup manager.
//!
//! A single-consumer bounded queue of deferred maintenance actions: pruning
//! an MVV-heavy page, collecting a long-record chain into the volume free
//! list, sweeping settled antivalues out of a key range, verifying a tree
//! after a crash. Writers enqueue and move on; the worker drains the queue
//! at a poll interval. A full queue refuses work (the writer will requeue
//! or a later pass will rediscover it) rather than blocking the write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;

use crate::common::{PageAddress, Result, VolumeHandle};

/// One deferred action. Trees are named by their root page so an action
/// stays valid across engine restarts of the enqueueing cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Prune the multi-version values on a page.
    PruneMvv {
        volume: VolumeHandle,
        page: PageAddress,
    },
    /// Return every page of a long-record chain to the volume free list.
    CollectLongRecord {
        volume: VolumeHandle,
        head: PageAddress,
    },
    /// Remove settled antivalue records in `[low, high)` of a tree.
    RemoveAntivalues {
        volume: VolumeHandle,
        tree_root: PageAddress,
        low: Vec<u8>,
        high: Vec<u8>,
    },
    /// Structural verification of a tree after recovery.
    VerifyTree {
        volume: VolumeHandle,
        tree_root: PageAddress,
    },
}

/// Executes actions; implemented by the root object, which owns the pools
/// and cursors the work needs.
pub trait CleanupExecutor: Send + Sync {
    fn execute(&self, action: &CleanupAction) -> Result<()>;
}

/// Counter snapshot for the statistics surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupCounters {
    pub accepted: u64,
    pub refused: u64,
    pub performed: u64,
    pub errors: u64,
    pub enqueued: usize,
}

pub struct CleanupManager {
    sender: Sender<CleanupAction>,
    receiver: Receiver<CleanupAction>,
    accepted: AtomicU64,
    refused: AtomicU64,
    performed: AtomicU64,
    errors: AtomicU64,
    /// Pause after a failed action before touching the queue again, so a
    /// contended page cannot spin the worker.
    retry_delay: Duration,
}

impl CleanupManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Offer an action. Returns false (and counts a refusal) when the
    /// queue is full.
    pub fn enqueue(&self, action: CleanupAction) -> bool {
        match self.sender.try_send(action) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drain the queue once. Failed actions are requeued for a later pass
    /// with a short pause so hot pages do not spin.
    pub fn run_once(&self, executor: &Arc<dyn CleanupExecutor>) {
        // bound the pass to the work present when it started; requeued
        // failures wait for the next pass
        let batch = self.receiver.len();
        for _ in 0..batch {
            let Ok(action) = self.receiver.try_recv() else {
                break;
            };
            match executor.execute(&action) {
                Ok(()) => {
                    self.performed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    debug!("cleanup action failed, requeueing: {}", e);
                    let _ = self.sender.try_send(action);
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }

    pub fn counters(&self) -> CleanupCounters {
        CleanupCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            performed: self.performed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            enqueued: self.receiver.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use parking_lot::Mutex;

    struct Recording {
        seen: Mutex<Vec<CleanupAction>>,
        fail_first: Mutex<bool>,
    }

    impl CleanupExecutor for Recording {
        fn execute(&self, action: &CleanupAction) -> Result<()> {
            let mut fail = self.fail_first.lock();
            if *fail {
                *fail = false;
                return Err(Error::PoolSaturated);
            }
            self.seen.lock().push(action.clone());
            Ok(())
        }
    }

    fn prune(page: u64) -> CleanupAction {
        CleanupAction::PruneMvv {
            volume: VolumeHandle::new(1),
            page: PageAddress::new(page),
        }
    }

    #[test]
    fn test_enqueue_and_drain() {
        let manager = CleanupManager::new(16);
        let executor: Arc<dyn CleanupExecutor> = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_first: Mutex::new(false),
        });

        assert!(manager.enqueue(prune(1)));
        assert!(manager.enqueue(prune(2)));
        manager.run_once(&executor);

        let counters = manager.counters();
        assert_eq!(counters.accepted, 2);
        assert_eq!(counters.performed, 2);
        assert_eq!(counters.enqueued, 0);
    }

    #[test]
    fn test_full_queue_refuses() {
        let manager = CleanupManager::new(1);
        assert!(manager.enqueue(prune(1)));
        assert!(!manager.enqueue(prune(2)));
        assert_eq!(manager.counters().refused, 1);
    }

    #[test]
    fn test_failed_action_requeued() {
        let manager = CleanupManager::new(16);
        let executor: Arc<dyn CleanupExecutor> = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_first: Mutex::new(true),
        });

        manager.enqueue(prune(1));
        manager.run_once(&executor);
        let counters = manager.counters();
        assert_eq!(counters.errors, 1);
        assert_eq!(counters.enqueued, 1); // waiting for the next pass

        manager.run_once(&executor);
        assert_eq!(manager.counters().performed, 1);
    }
}
