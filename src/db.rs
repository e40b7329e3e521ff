//! The root object.
//!
//! [`Database::open`] takes a validated [`Config`] through the full
//! initialization sequence: volumes are opened and locked, the journal is
//! scanned, authoritative page images are copied into volumes, committed
//! transactions are replayed, and only then do the background tasks start
//! (journal flusher, copier, checkpoint manager, cleanup manager, eviction
//! sweep). `close` runs the sequence in reverse, finishing with a final
//! checkpoint; `crash` stops the engine without flushing anything, which is
//! what the recovery tests feed on.
//!
//! There are no process-wide globals: every subsystem hangs off this
//! object, and independent `Database` instances coexist (the volume file
//! locks keep them off each other's files).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::alert::{AlertLevel, AlertMonitor, AlertSnapshot};
use crate::buffer::{BufferPool, PageWriteBack, PoolGauges, StatsSnapshot};
use crate::checkpoint::CheckpointManager;
use crate::cleanup::{CleanupAction, CleanupCounters, CleanupExecutor, CleanupManager};
use crate::common::config::{JOURNAL_FILE_COUNT_HARD_CAP, MAXIMUM_CONCURRENT_TRANSACTIONS};
use crate::common::{
    Config, Error, JournalAddress, PageAddress, Result, Timestamp, TimestampSource, TreeHandle,
    VolumeHandle,
};
use crate::journal::record::RecordPayload;
use crate::journal::{Copier, JournalManager, JournalStats, RecoveryManager, RecoveryReport};
use crate::mvcc::{IndexDepths, TransactionIndex};
use crate::storage::{Page, Volume, VolumeIdentity};
use crate::tree::{self, Cursor, Tree, TreeContext};
use crate::txn::Transaction;

/// Journals a page image and writes it through to the owning volume.
/// Installed as every pool's write-back hook.
struct JournalingWriteBack {
    journal: Arc<JournalManager>,
    volumes: HashMap<VolumeHandle, Arc<Volume>>,
}

impl PageWriteBack for JournalingWriteBack {
    fn write_back(
        &self,
        volume: VolumeHandle,
        page: PageAddress,
        image: &Page,
    ) -> Result<JournalAddress> {
        let ts = image.header().timestamp;
        let addr = self.journal.append(
            ts,
            &RecordPayload::PageImage {
                volume,
                page,
                image: image.as_slice().to_vec(),
            },
        )?;
        // write-ahead: the image reaches the journal file before the
        // volume write. Neither is durable yet; whoever fsyncs a volume
        // (checkpoint, copier) forces the journal first, so a page can
        // never be durable in its volume ahead of its journal image.
        self.journal.flush()?;

        let target = self
            .volumes
            .get(&volume)
            .ok_or(Error::PageNotFound { volume, page })?;
        let mut copy = Page::from_bytes(image.as_slice());
        target.write_page(page, &mut copy)?;
        Ok(addr)
    }
}

/// Runs deferred maintenance on behalf of the cleanup manager.
struct Maintenance {
    contexts: HashMap<VolumeHandle, Arc<TreeContext>>,
}

impl Maintenance {
    fn cursor_for(&self, volume: VolumeHandle, root: PageAddress) -> Result<Cursor> {
        let ctx = self
            .contexts
            .get(&volume)
            .ok_or(Error::Config(format!("unknown volume {}", volume)))?;
        Ok(Cursor::new(
            Arc::clone(ctx),
            Tree {
                handle: TreeHandle::new(0),
                name: String::new(),
                volume,
                root,
            },
        ))
    }
}

impl CleanupExecutor for Maintenance {
    fn execute(&self, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::PruneMvv { volume, page } => {
                self.cursor_for(*volume, *page)?.prune_page(*page)
            }
            CleanupAction::CollectLongRecord { volume, head } => {
                self.cursor_for(*volume, *head)?
                    .collect_long_chain(*head)
                    .map(|_| ())
            }
            CleanupAction::RemoveAntivalues {
                volume,
                tree_root,
                low,
                high,
            } => self.cursor_for(*volume, *tree_root)?.prune_range(low, high),
            CleanupAction::VerifyTree { volume, tree_root } => {
                self.cursor_for(*volume, *tree_root)?.verify()
            }
        }
    }
}

pub struct Database {
    config: Config,
    timestamps: Arc<TimestampSource>,
    alert: Arc<AlertMonitor>,
    journal: Arc<JournalManager>,
    tx_index: Arc<TransactionIndex>,
    cleanup: Arc<CleanupManager>,
    /// One pool per configured page size.
    pools: HashMap<usize, Arc<BufferPool>>,
    /// Volumes by name.
    volumes: HashMap<String, Arc<Volume>>,
    /// Journaling cursor context per volume.
    contexts: HashMap<String, Arc<TreeContext>>,
    checkpoints: Arc<CheckpointManager>,
    copier: Arc<Copier>,
    recovery_report: RecoveryReport,

    trees: Mutex<HashMap<(String, String), Tree>>,
    tree_handles: AtomicU32,
    tree_create_lock: Mutex<()>,

    closing: Arc<AtomicBool>,
    closed: AtomicBool,
    task_stops: Mutex<Vec<Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Database {
    /// Initialize the engine: open volumes, recover, start background
    /// tasks.
    pub fn open(mut config: Config) -> Result<Arc<Database>> {
        config.validate()?;
        std::fs::create_dir_all(&config.datapath)?;

        let timestamps = Arc::new(TimestampSource::new());
        let alert = Arc::new(AlertMonitor::new());

        // volumes, exclusively locked
        let mut volumes: HashMap<String, Arc<Volume>> = HashMap::new();
        let mut volume_handles: HashMap<VolumeHandle, Arc<Volume>> = HashMap::new();
        for (i, spec) in config.volumes.iter().enumerate() {
            let handle = VolumeHandle::new(i as u32 + 1);
            let path = config.volume_path(spec);
            let volume = Arc::new(Volume::open_or_create(&path, spec, handle)?);
            volume_handles.insert(handle, Arc::clone(&volume));
            volumes.insert(spec.name.clone(), volume);
        }

        // scan the journal and put authoritative page images in place
        let prefix = config.journal_prefix();
        let recovery = RecoveryManager::scan(&prefix)?;
        let mut report = recovery.report.clone();
        for ((volume_name, page), (addr, ts)) in &recovery.plan.page_map {
            let Some(volume) = volumes.get(volume_name) else {
                warn!("journal names unknown volume {:?}", volume_name);
                report.errors += 1;
                continue;
            };
            let page_addr = PageAddress::new(*page);
            // a torn or short on-disk page is exactly what the journaled
            // image is for
            let on_disk = match volume.page_timestamp(page_addr) {
                Ok(on_disk) => on_disk,
                Err(Error::CorruptPage { .. }) | Err(Error::ShortRead { .. }) => Timestamp::ZERO,
                Err(e) => return Err(e),
            };
            if on_disk >= *ts {
                continue;
            }
            let record = recovery.read_record_at(*addr)?;
            let RecordPayload::PageImage { image, .. } = record.payload else {
                return Err(Error::CorruptJournal(*addr));
            };
            if image.len() != volume.page_size() {
                report.errors += 1;
                continue;
            }
            volume.note_recovered_page(page_addr);
            volume.write_page(page_addr, &mut Page::from_bytes(&image))?;
            report.applied_pages += 1;
        }
        for volume in volumes.values() {
            volume.sync()?;
        }

        timestamps.advance_to(recovery.plan.max_timestamp);

        // continue the journal at the validated end
        let journal = Arc::new(JournalManager::open(
            &prefix,
            config.journal_block_size,
            recovery.plan.positions,
        )?);

        let tx_index = Arc::new(TransactionIndex::new(MAXIMUM_CONCURRENT_TRANSACTIONS));
        for start_ts in &recovery.plan.uncommitted {
            tx_index.register_recovered_aborted(Timestamp::new(*start_ts));
        }

        let cleanup = Arc::new(CleanupManager::new(config.cleanup_queue_capacity));

        // pools, with the journaling write-back hook
        let mut pools: HashMap<usize, Arc<BufferPool>> = HashMap::new();
        for spec in &config.buffers {
            let frames = spec.sizing.frame_count(spec.page_size);
            pools.insert(spec.page_size, Arc::new(BufferPool::new(frames, spec.page_size)));
        }
        let hook: Arc<dyn PageWriteBack> = Arc::new(JournalingWriteBack {
            journal: Arc::clone(&journal),
            volumes: volume_handles.clone(),
        });
        for pool in pools.values() {
            pool.set_write_back(Arc::clone(&hook));
        }

        // bind volume handles to identities on this journal epoch
        for (handle, volume) in &volume_handles {
            let identity = volume.identity();
            journal.append(
                Timestamp::ZERO,
                &RecordPayload::IdentifyVolume {
                    volume: *handle,
                    id: identity.id,
                    created_at: identity.created_at,
                    name: volume.name().to_string(),
                },
            )?;
        }

        // per-volume cursor contexts
        let mut contexts: HashMap<String, Arc<TreeContext>> = HashMap::new();
        for (name, volume) in &volumes {
            let pool = Arc::clone(&pools[&volume.page_size()]);
            contexts.insert(
                name.clone(),
                Arc::new(TreeContext {
                    pool,
                    volume: Arc::clone(volume),
                    journal: Arc::clone(&journal),
                    tx_index: Arc::clone(&tx_index),
                    cleanup: Arc::clone(&cleanup),
                    timestamps: Arc::clone(&timestamps),
                    max_key_size: TreeContext::effective_max_key(
                        config.max_key_size,
                        volume.page_size(),
                    ),
                    max_value_size: config.max_value_size,
                    journaling: true,
                }),
            );
        }

        let pool_list: Vec<Arc<BufferPool>> = pools.values().cloned().collect();
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&journal),
            pool_list.clone(),
            volume_handles.clone(),
            Arc::clone(&tx_index),
            Arc::clone(&timestamps),
            Arc::clone(&alert),
            config.append_only,
        ));
        let copier = Arc::new(Copier::new(
            Arc::clone(&journal),
            pool_list.clone(),
            volume_handles.clone(),
            Arc::clone(&tx_index),
            Arc::clone(&alert),
            config.append_only,
        ));

        let db = Arc::new(Database {
            config,
            timestamps,
            alert,
            journal,
            tx_index,
            cleanup,
            pools,
            volumes,
            contexts,
            checkpoints,
            copier,
            recovery_report: report,
            trees: Mutex::new(HashMap::new()),
            tree_handles: AtomicU32::new(1),
            tree_create_lock: Mutex::new(()),
            closing: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            task_stops: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        db.replay_committed(&recovery)?;
        db.recovery_cleanup(&recovery)?;

        // a fresh keystone right away keeps the recovery window small
        db.checkpoints.checkpoint(&|| false)?;

        db.start_tasks();
        info!(
            "database open: {} volumes, {} committed transactions recovered",
            db.volumes.len(),
            db.recovery_report.committed_transactions
        );
        Ok(db)
    }

    /// Re-apply the logical records of committed transactions, in journal
    /// order, as primordial values stamped with the commit timestamp.
    fn replay_committed(&self, recovery: &RecoveryManager) -> Result<()> {
        let mut replay_contexts: HashMap<String, Arc<TreeContext>> = HashMap::new();
        for (name, ctx) in &self.contexts {
            replay_contexts.insert(
                name.clone(),
                Arc::new(TreeContext {
                    pool: Arc::clone(&ctx.pool),
                    volume: Arc::clone(&ctx.volume),
                    journal: Arc::clone(&ctx.journal),
                    tx_index: Arc::clone(&ctx.tx_index),
                    cleanup: Arc::clone(&ctx.cleanup),
                    timestamps: Arc::clone(&ctx.timestamps),
                    max_key_size: ctx.max_key_size,
                    max_value_size: ctx.max_value_size,
                    // their SR/DR records are already in the journal
                    journaling: false,
                }),
            );
        }

        // trees the journal knows about exist again afterwards, even if
        // their directory pages were never copied back
        for (volume_name, tree_name) in &recovery.plan.trees {
            if tree_name == tree::DIRECTORY_TREE_NAME {
                continue;
            }
            if let Some(ctx) = replay_contexts.get(volume_name) {
                if tree::lookup_tree(ctx, tree_name, TreeHandle::new(0))?.is_none() {
                    tree::create_tree(ctx, tree_name, TreeHandle::new(0))?;
                }
            }
        }

        let mut applied = 0usize;
        for logical in recovery.committed_logical() {
            let Some(ctx) = replay_contexts.get(&logical.volume) else {
                continue;
            };
            let commit_ts = recovery
                .commit_ts_of(logical.start_ts)
                .expect("committed_logical is filtered");
            let record = recovery.read_record_at(logical.addr)?;

            let tree = match tree::lookup_tree(ctx, &logical.tree, TreeHandle::new(0))? {
                Some(tree) => tree,
                None => match &record.payload {
                    RecordPayload::DeleteTree { .. } => continue,
                    _ => tree::create_tree(ctx, &logical.tree, TreeHandle::new(0))?,
                },
            };
            let cursor = Cursor::new(Arc::clone(ctx), tree.clone());

            match record.payload {
                RecordPayload::Store { key, value, .. } => {
                    cursor.system_store(&key, &value, commit_ts)?;
                }
                RecordPayload::DeleteRange { low, high, .. } => {
                    cursor.system_remove_range(&low, &high, commit_ts)?;
                }
                RecordPayload::DeleteTree { .. } => {
                    tree::remove_tree(ctx, &tree)?;
                }
                _ => return Err(Error::CorruptJournal(logical.addr)),
            }
            applied += 1;
        }
        debug!("recovery replayed {} logical records", applied);
        Ok(())
    }

    /// Post-recovery deferred work: verify every known tree; stray pages
    /// of aborted or uncommitted transactions get pruned as their pages
    /// are revisited.
    fn recovery_cleanup(&self, recovery: &RecoveryManager) -> Result<()> {
        for (volume_name, tree_name) in &recovery.plan.trees {
            if tree_name == tree::DIRECTORY_TREE_NAME {
                continue;
            }
            let Some(ctx) = self.contexts.get(volume_name) else {
                continue;
            };
            if let Some(tree) = tree::lookup_tree(ctx, tree_name, TreeHandle::new(0))? {
                self.cleanup.enqueue(CleanupAction::VerifyTree {
                    volume: tree.volume,
                    tree_root: tree.root,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_task(
        &self,
        name: &'static str,
        interval: Duration,
        mut body: impl FnMut() + Send + 'static,
    ) {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(0);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => body(),
                    // disconnect or explicit stop: finish the iteration
                    _ => break,
                }
            })
            .expect("task spawn");
        self.task_stops.lock().push(stop_tx);
        self.tasks.lock().push(handle);
    }

    fn start_tasks(self: &Arc<Self>) {
        let journal = Arc::clone(&self.journal);
        let alert = Arc::clone(&self.alert);
        self.spawn_task("ldb-flusher", self.config.flush_interval, move || {
            match journal.force() {
                Ok(()) => {}
                Err(e) => alert.report(AlertLevel::Error, "flusher", &format!("{}", e)),
            }
        });

        let copier = Arc::clone(&self.copier);
        self.spawn_task("ldb-copier", self.config.copier_interval, move || {
            copier.run_once();
        });

        let checkpoints = Arc::clone(&self.checkpoints);
        let closing = Arc::clone(&self.closing);
        let alert = Arc::clone(&self.alert);
        self.spawn_task("ldb-checkpoint", self.config.checkpoint_interval, move || {
            let abandon = || closing.load(Ordering::Acquire);
            if let Err(e) = checkpoints.checkpoint(&abandon) {
                alert.report(AlertLevel::Error, "checkpoint", &format!("{}", e));
            }
        });

        let cleanup = Arc::clone(&self.cleanup);
        let executor: Arc<dyn CleanupExecutor> = Arc::new(Maintenance {
            contexts: self
                .contexts
                .values()
                .map(|ctx| (ctx.volume.handle(), Arc::clone(ctx)))
                .collect(),
        });
        self.spawn_task("ldb-cleanup", self.config.cleanup_poll_interval, move || {
            cleanup.run_once(&executor);
        });

        let pools: Vec<Arc<BufferPool>> = self.pools.values().cloned().collect();
        let tx_index = Arc::clone(&self.tx_index);
        self.spawn_task("ldb-evictor", self.config.eviction_interval, move || {
            tx_index.update_active_cache();
            for pool in &pools {
                pool.eviction_sweep();
            }
        });
    }

    fn stop_tasks(&self) {
        self.task_stops.lock().clear(); // disconnects every task channel
        for handle in self.tasks.lock().drain(..) {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Public API: transactions and cursors
    // ------------------------------------------------------------------

    /// Begin a transaction. Slowed, then refused, as journal files pile up
    /// faster than the copier returns them.
    pub fn begin(&self) -> Result<Transaction> {
        if self.closed.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let file_count = self.journal.file_count();
        if file_count >= JOURNAL_FILE_COUNT_HARD_CAP {
            return Err(Error::JournalFileCap(JOURNAL_FILE_COUNT_HARD_CAP));
        }
        let urgency = self
            .journal
            .urgency(self.config.urgent_file_count_threshold);
        if urgency > 0 {
            // admission control: lean on new transactions so the copier
            // can catch up
            std::thread::sleep(Duration::from_millis(10 * urgency as u64));
        }

        Transaction::begin(
            Arc::clone(&self.journal),
            Arc::clone(&self.tx_index),
            Arc::clone(&self.timestamps),
            self.config.commit_policy,
        )
    }

    /// Open a cursor ("exchange") on `(volume, tree)`.
    pub fn cursor(&self, volume: &str, tree: &str, create: bool) -> Result<Cursor> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let ctx = self
            .contexts
            .get(volume)
            .ok_or_else(|| Error::Config(format!("unknown volume {:?}", volume)))?;
        let tree = self.ensure_tree(ctx, volume, tree, create)?;
        Ok(Cursor::new(Arc::clone(ctx), tree))
    }

    fn ensure_tree(
        &self,
        ctx: &Arc<TreeContext>,
        volume: &str,
        name: &str,
        create: bool,
    ) -> Result<Tree> {
        if name == tree::DIRECTORY_TREE_NAME {
            return Err(Error::Config("the directory tree is not addressable".into()));
        }
        let cache_key = (volume.to_string(), name.to_string());
        if let Some(tree) = self.trees.lock().get(&cache_key) {
            return Ok(tree.clone());
        }

        let _serialize = self.tree_create_lock.lock();
        if let Some(tree) = self.trees.lock().get(&cache_key) {
            return Ok(tree.clone());
        }

        let handle = TreeHandle::new(self.tree_handles.fetch_add(1, Ordering::Relaxed));
        let found = tree::lookup_tree(ctx, name, handle)?;
        let tree = match found {
            Some(tree) => tree,
            None if create => tree::create_tree(ctx, name, handle)?,
            None => return Err(Error::TreeNotFound(name.to_string())),
        };

        // bind the handle before any SR can reference it
        self.journal.append(
            Timestamp::ZERO,
            &RecordPayload::IdentifyTree {
                tree: handle,
                volume: ctx.volume.handle(),
                name: name.to_string(),
            },
        )?;

        self.trees.lock().insert(cache_key, tree.clone());
        Ok(tree)
    }

    /// Tree names in a volume.
    pub fn list_trees(&self, volume: &str) -> Result<Vec<String>> {
        let ctx = self
            .contexts
            .get(volume)
            .ok_or_else(|| Error::Config(format!("unknown volume {:?}", volume)))?;
        tree::list_trees(ctx)
    }

    /// Drop a tree and reclaim its pages.
    pub fn remove_tree(&self, volume: &str, name: &str) -> Result<()> {
        let ctx = self
            .contexts
            .get(volume)
            .ok_or_else(|| Error::Config(format!("unknown volume {:?}", volume)))?;
        // binds a handle (and journals IT) so the DT record below can be
        // resolved during recovery
        let tree = self.ensure_tree(ctx, volume, name, false)?;

        let _serialize = self.tree_create_lock.lock();
        self.trees
            .lock()
            .remove(&(volume.to_string(), name.to_string()));
        self.journal.append(
            self.timestamps.next(),
            &RecordPayload::DeleteTree { tree: tree.handle },
        )?;
        tree::remove_tree(ctx, &tree)
    }

    // ------------------------------------------------------------------
    // Public API: maintenance and statistics
    // ------------------------------------------------------------------

    /// Force the journal to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.journal.force()
    }

    /// Run one checkpoint now.
    pub fn checkpoint(&self) -> Result<Option<Timestamp>> {
        let closing = Arc::clone(&self.closing);
        self.checkpoints
            .checkpoint(&move || closing.load(Ordering::Acquire))
    }

    /// Run one copier cycle now (write-back plus base advance).
    pub fn copy_back(&self) {
        self.copier.run_once();
    }

    pub fn journal_stats(&self) -> JournalStats {
        self.journal.stats()
    }

    pub fn pool_stats(&self, page_size: usize) -> Option<(StatsSnapshot, PoolGauges)> {
        self.pools
            .get(&page_size)
            .map(|p| (p.stats().snapshot(), p.gauges()))
    }

    pub fn transaction_depths(&self) -> IndexDepths {
        self.tx_index.depths()
    }

    pub fn cleanup_counters(&self) -> CleanupCounters {
        self.cleanup.counters()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    pub fn alerts(&self) -> Vec<AlertSnapshot> {
        self.alert.snapshot()
    }

    /// Identity and sizing of a volume.
    pub fn volume_info(&self, name: &str) -> Option<(VolumeIdentity, u64, usize)> {
        self.volumes
            .get(name)
            .map(|v| (v.identity(), v.page_count(), v.page_size()))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: wait (briefly) for transactions to finish, take
    /// a final checkpoint, stop the background tasks, sync everything.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.store(true, Ordering::Release);

        // a transaction begun and never ended blocks shutdown for at most
        // the grace period
        let deadline = Instant::now() + self.config.close_grace_period;
        loop {
            let depths = self.tx_index.depths();
            if depths.current == 0 && depths.long_running == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} transactions still active at close; proceeding",
                    depths.current + depths.long_running
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let give_up = {
            let deadline = Instant::now() + self.config.close_grace_period;
            move || Instant::now() >= deadline
        };
        match self.checkpoints.checkpoint(&give_up) {
            Ok(Some(ts)) => debug!("final checkpoint {}", ts),
            Ok(None) => warn!("final checkpoint abandoned"),
            Err(e) => warn!("final checkpoint failed: {}", e),
        }

        self.stop_tasks();
        self.journal.force()?;
        for volume in self.volumes.values() {
            volume.write_head()?;
            volume.sync()?;
        }
        info!("database closed");
        Ok(())
    }

    /// Stop the engine as a crash would: no checkpoint, no flush beyond
    /// what is already durable. Recovery tests use this.
    pub fn crash(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.store(true, Ordering::Release);
        self.stop_tasks();
        info!("database crashed (by request)");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            // never block in drop; the journal already holds everything a
            // restart needs
            self.closing.store(true, Ordering::Release);
            self.stop_tasks();
        }
    }
}
