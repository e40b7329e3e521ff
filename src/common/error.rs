//! Error types for ledgerdb.
//!
//! A single crate-wide [`Error`] enum keeps error handling consistent across
//! every subsystem. Variants are grouped by kind: configuration, storage I/O,
//! journal integrity, key/value validity, concurrency, resource exhaustion,
//! and transaction state misuse.

use std::path::PathBuf;

use thiserror::Error;

use crate::common::handles::{JournalAddress, PageAddress, VolumeHandle};

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in ledgerdb.
#[derive(Debug, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Configuration - surfaced at initialization, never recovered.
    // ------------------------------------------------------------------
    /// Invalid option or option combination.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another engine instance holds the advisory lock on a volume file.
    #[error("volume file {0} is locked by another process")]
    VolumeInUse(PathBuf),

    // ------------------------------------------------------------------
    // Storage I/O
    // ------------------------------------------------------------------
    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page read produced fewer bytes than a full page.
    #[error("short read of page {page} in volume {volume}")]
    ShortRead {
        volume: VolumeHandle,
        page: PageAddress,
    },

    /// A page failed its checksum on read.
    #[error("checksum mismatch on page {page} in volume {volume}")]
    CorruptPage {
        volume: VolumeHandle,
        page: PageAddress,
    },

    /// The requested page lies beyond the end of the volume.
    #[error("page {page} not found in volume {volume}")]
    PageNotFound {
        volume: VolumeHandle,
        page: PageAddress,
    },

    /// No tree with the given name exists in the volume.
    #[error("tree {0:?} not found")]
    TreeNotFound(String),

    // ------------------------------------------------------------------
    // Journal integrity
    // ------------------------------------------------------------------
    /// A journal record failed its length or checksum validation.
    ///
    /// During recovery this truncates replay; during normal reads it is
    /// surfaced to the caller.
    #[error("corrupt journal record at address {0}")]
    CorruptJournal(JournalAddress),

    // ------------------------------------------------------------------
    // Key / value validity - surfaced synchronously to the caller.
    // ------------------------------------------------------------------
    /// Encoded key exceeds the storable ceiling.
    #[error("key of {len} bytes exceeds the maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    /// An empty key is not storable.
    #[error("empty key")]
    EmptyKey,

    /// The BEFORE/AFTER sentinels seed traversals and are not storable.
    #[error("sentinel key is not storable")]
    SentinelKey,

    /// Value exceeds the configured maximum.
    #[error("value of {len} bytes exceeds the maximum of {max}")]
    ValueTooLarge { len: usize, max: usize },

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------
    /// The transaction must be rolled back: a write-write conflict with a
    /// concurrent transaction, or an explicit rollback request.
    #[error("transaction rolled back")]
    Rollback,

    /// A pin claim could not be acquired within the timeout.
    #[error("timed out acquiring a {mode} claim on page {page} of volume {volume}")]
    ClaimTimeout {
        volume: VolumeHandle,
        page: PageAddress,
        mode: &'static str,
    },

    // ------------------------------------------------------------------
    // Resource exhaustion
    // ------------------------------------------------------------------
    /// The volume reached its configured maximum page count.
    #[error("volume {0} reached its maximum page count")]
    VolumeFull(VolumeHandle),

    /// Every frame in the buffer pool is pinned.
    #[error("buffer pool exhausted: all frames pinned")]
    PoolSaturated,

    /// The journal reached its hard file-count cap.
    #[error("journal file count reached the hard cap of {0}")]
    JournalFileCap(usize),

    /// The transaction index cannot admit another concurrent transaction.
    #[error("too many concurrent transactions (limit {0})")]
    TooManyTransactions(usize),

    // ------------------------------------------------------------------
    // Transaction state - programmer errors.
    // ------------------------------------------------------------------
    /// Commit or rollback without a matching begin.
    #[error("no transaction is active on this handle")]
    NoActiveTransaction,

    /// Begin while a transaction is already active.
    #[error("a transaction is already active on this handle")]
    TransactionAlreadyActive,

    /// The engine is closed (or closing) and cannot accept the operation.
    #[error("database is closed")]
    Closed,
}

impl Error {
    /// True for the rollback outcome, which callers may retry.
    #[inline]
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::KeyTooLong { len: 3000, max: 2047 };
        assert_eq!(format!("{}", err), "key of 3000 bytes exceeds the maximum of 2047");

        let err = Error::PoolSaturated;
        assert_eq!(format!("{}", err), "buffer pool exhausted: all frames pinned");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_rollback() {
        assert!(Error::Rollback.is_rollback());
        assert!(!Error::EmptyKey.is_rollback());
    }
}
