//! Engine configuration.
//!
//! The engine receives a fully typed [`Config`]; option parsing belongs to
//! the embedding application. `Config::validate` applies every bound at
//! initialization so that an invalid combination can never surface later as
//! a runtime surprise.

use std::path::PathBuf;
use std::time::Duration;

use crate::common::error::{Error, Result};

/// Smallest supported page size (1 KiB).
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size (16 KiB).
pub const MAX_PAGE_SIZE: usize = 16 * 1024;

/// Default journal block (per-file) size: ~1 GB.
pub const DEFAULT_JOURNAL_BLOCK_SIZE: u64 = 1_000_000_000;

/// Minimum journal block size: ~10 MB.
pub const MIN_JOURNAL_BLOCK_SIZE: u64 = 10_000_000;

/// Maximum journal block size: ~100 GB.
pub const MAX_JOURNAL_BLOCK_SIZE: u64 = 100_000_000_000;

/// Default journal flusher period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default journal copier period.
pub const DEFAULT_COPIER_INTERVAL: Duration = Duration::from_secs(10);

/// Default checkpoint period; must stay within [10 s, 3600 s].
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(120);
pub const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(3600);

/// Journal file count above which new transactions are slowed.
pub const DEFAULT_URGENT_FILE_COUNT_THRESHOLD: usize = 15;

/// Journal file count at which new transactions fail outright.
pub const JOURNAL_FILE_COUNT_HARD_CAP: usize = 100;

/// Upper bound on simultaneously active transactions.
pub const MAXIMUM_CONCURRENT_TRANSACTIONS: usize = 10_000;

/// Default ceiling on an encoded key. Must be at least 1 KiB; the storable
/// ceiling for a given tree is additionally limited by its page size.
pub const DEFAULT_MAX_KEY_SIZE: usize = 2047;

/// Default ceiling on a value.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// Default capacity of the cleanup manager's work queue.
pub const DEFAULT_CLEANUP_QUEUE_CAPACITY: usize = 50_000;

/// Default cleanup manager poll period.
pub const DEFAULT_CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default buffer-pool eviction sweep period.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_millis(500);

/// How long `close` waits for straggler transactions before giving up.
pub const DEFAULT_CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// When a commit must be durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Commit blocks until its TC record is fsynced.
    #[default]
    Hard,
    /// Commits are batched behind a single fsync.
    Group,
    /// Durability is deferred to the flusher interval.
    Soft,
}

/// Pool sizing: by frame count or by total bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSizing {
    Count(usize),
    Memory(u64),
}

impl BufferSizing {
    /// Resolve to a frame count for the given page size.
    pub fn frame_count(&self, page_size: usize) -> usize {
        match *self {
            BufferSizing::Count(n) => n,
            BufferSizing::Memory(bytes) => (bytes / page_size as u64) as usize,
        }
    }
}

/// Sizing of the buffer pool serving one page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub page_size: usize,
    pub sizing: BufferSizing,
}

/// Specification of one volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// File path; relative paths resolve under `Config::datapath`.
    pub path: PathBuf,
    /// Name by which trees address this volume.
    pub name: String,
    /// Create the file if absent.
    pub create: bool,
    /// Page size, a power of two in [`MIN_PAGE_SIZE`], [`MAX_PAGE_SIZE`].
    pub page_size: usize,
    /// Pages pre-allocated at creation.
    pub initial_pages: u64,
    /// Pages added per file extension.
    pub extension_pages: u64,
    /// Hard ceiling on the page count.
    pub maximum_pages: u64,
}

impl VolumeSpec {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            create: true,
            page_size,
            initial_pages: 32,
            extension_pages: 32,
            maximum_pages: u64::MAX / page_size as u64,
        }
    }
}

/// The complete engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for volumes and journal files.
    pub datapath: PathBuf,
    /// Volumes to open at initialization.
    pub volumes: Vec<VolumeSpec>,
    /// Buffer pool sizing, one entry per distinct page size in use.
    pub buffers: Vec<BufferSpec>,
    /// Journal file prefix; defaults to `<datapath>/ledgerdb_journal`.
    pub journal_path: Option<PathBuf>,
    /// Per-journal-file size.
    pub journal_block_size: u64,
    /// Journal flusher period.
    pub flush_interval: Duration,
    /// Journal copier period.
    pub copier_interval: Duration,
    /// Checkpoint period, clamped to [10 s, 3600 s] by `validate`.
    pub checkpoint_interval: Duration,
    /// Commit durability policy.
    pub commit_policy: CommitPolicy,
    /// Suppress copy-back; journal files accumulate.
    pub append_only: bool,
    /// Journal file count above which new transactions are slowed.
    pub urgent_file_count_threshold: usize,
    /// Ceiling on an encoded key.
    pub max_key_size: usize,
    /// Ceiling on a value.
    pub max_value_size: usize,
    /// Capacity of the cleanup work queue.
    pub cleanup_queue_capacity: usize,
    /// Cleanup manager poll period.
    pub cleanup_poll_interval: Duration,
    /// Buffer-pool eviction sweep period.
    pub eviction_interval: Duration,
    /// Grace period `close` grants to unfinished transactions.
    pub close_grace_period: Duration,
}

impl Config {
    /// A configuration with every knob at its default and no volumes.
    pub fn new(datapath: impl Into<PathBuf>) -> Self {
        Self {
            datapath: datapath.into(),
            volumes: Vec::new(),
            buffers: Vec::new(),
            journal_path: None,
            journal_block_size: DEFAULT_JOURNAL_BLOCK_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            copier_interval: DEFAULT_COPIER_INTERVAL,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            commit_policy: CommitPolicy::default(),
            append_only: false,
            urgent_file_count_threshold: DEFAULT_URGENT_FILE_COUNT_THRESHOLD,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            cleanup_queue_capacity: DEFAULT_CLEANUP_QUEUE_CAPACITY,
            cleanup_poll_interval: DEFAULT_CLEANUP_POLL_INTERVAL,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
            close_grace_period: DEFAULT_CLOSE_GRACE_PERIOD,
        }
    }

    /// Resolved journal file prefix.
    pub fn journal_prefix(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| self.datapath.join("ledgerdb_journal"))
    }

    /// Resolve a volume path against `datapath`.
    pub fn volume_path(&self, spec: &VolumeSpec) -> PathBuf {
        if spec.path.is_absolute() {
            spec.path.clone()
        } else {
            self.datapath.join(&spec.path)
        }
    }

    /// Check every bound; clamp the checkpoint interval into its range.
    ///
    /// Errors here are configuration errors: they surface at initialization
    /// and are never recovered.
    pub fn validate(&mut self) -> Result<()> {
        if self.volumes.is_empty() {
            return Err(Error::Config("at least one volume is required".into()));
        }

        for spec in &self.volumes {
            if !spec.page_size.is_power_of_two()
                || spec.page_size < MIN_PAGE_SIZE
                || spec.page_size > MAX_PAGE_SIZE
            {
                return Err(Error::Config(format!(
                    "volume {:?}: page size {} must be a power of two in [{}, {}]",
                    spec.name, spec.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
                )));
            }
            if spec.initial_pages < 2 {
                return Err(Error::Config(format!(
                    "volume {:?}: initial_pages must be at least 2",
                    spec.name
                )));
            }
            if spec.extension_pages == 0 {
                return Err(Error::Config(format!(
                    "volume {:?}: extension_pages must be nonzero",
                    spec.name
                )));
            }
            if spec.maximum_pages < spec.initial_pages {
                return Err(Error::Config(format!(
                    "volume {:?}: maximum_pages {} is below initial_pages {}",
                    spec.name, spec.maximum_pages, spec.initial_pages
                )));
            }
            if !self.buffers.iter().any(|b| b.page_size == spec.page_size) {
                return Err(Error::Config(format!(
                    "volume {:?}: no buffer pool configured for page size {}",
                    spec.name, spec.page_size
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.volumes {
            if !seen.insert(spec.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate volume name {:?}",
                    spec.name
                )));
            }
        }

        for buf in &self.buffers {
            if buf.sizing.frame_count(buf.page_size) < 4 {
                return Err(Error::Config(format!(
                    "buffer pool for page size {} must hold at least 4 frames",
                    buf.page_size
                )));
            }
        }

        if self.journal_block_size < MIN_JOURNAL_BLOCK_SIZE
            || self.journal_block_size > MAX_JOURNAL_BLOCK_SIZE
        {
            return Err(Error::Config(format!(
                "journal block size {} outside [{}, {}]",
                self.journal_block_size, MIN_JOURNAL_BLOCK_SIZE, MAX_JOURNAL_BLOCK_SIZE
            )));
        }

        if self.urgent_file_count_threshold == 0
            || self.urgent_file_count_threshold >= JOURNAL_FILE_COUNT_HARD_CAP
        {
            return Err(Error::Config(format!(
                "urgent file count threshold {} outside (0, {})",
                self.urgent_file_count_threshold, JOURNAL_FILE_COUNT_HARD_CAP
            )));
        }

        if self.max_key_size < 1024 {
            return Err(Error::Config(format!(
                "max key size {} is below the 1 KiB floor",
                self.max_key_size
            )));
        }

        self.checkpoint_interval = self
            .checkpoint_interval
            .clamp(MIN_CHECKPOINT_INTERVAL, MAX_CHECKPOINT_INTERVAL);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_volume_config() -> Config {
        let mut config = Config::new("/tmp/ldb");
        config.volumes.push(VolumeSpec::new("data.v01", "data", 4096));
        config.buffers.push(BufferSpec {
            page_size: 4096,
            sizing: BufferSizing::Count(64),
        });
        config
    }

    #[test]
    fn test_valid_config() {
        let mut config = one_volume_config();
        config.validate().unwrap();
    }

    #[test]
    fn test_no_volumes_rejected() {
        let mut config = Config::new("/tmp/ldb");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let mut config = one_volume_config();
        config.volumes[0].page_size = 3000;
        assert!(config.validate().is_err());

        config.volumes[0].page_size = 512; // power of two but too small
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_buffer_pool_rejected() {
        let mut config = one_volume_config();
        config.buffers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_interval_clamped() {
        let mut config = one_volume_config();
        config.checkpoint_interval = Duration::from_secs(1);
        config.validate().unwrap();
        assert_eq!(config.checkpoint_interval, MIN_CHECKPOINT_INTERVAL);

        config.checkpoint_interval = Duration::from_secs(100_000);
        config.validate().unwrap();
        assert_eq!(config.checkpoint_interval, MAX_CHECKPOINT_INTERVAL);
    }

    #[test]
    fn test_memory_sizing() {
        let sizing = BufferSizing::Memory(1024 * 1024);
        assert_eq!(sizing.frame_count(4096), 256);
    }

    #[test]
    fn test_duplicate_volume_name_rejected() {
        let mut config = one_volume_config();
        config.volumes.push(VolumeSpec::new("other.v01", "data", 4096));
        assert!(config.validate().is_err());
    }
}
