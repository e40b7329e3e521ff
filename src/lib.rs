//! ledgerdb - an embeddable, transactional, ordered key/value store.
//!
//! Typed composite keys map to opaque byte values, durably stored in
//! page-structured volume files and protected by a write-ahead journal.
//! Concurrent transactions run under snapshot isolation over multi-version
//! values; a checkpoint/copy-back cycle bounds recovery work and returns
//! journal space.
//!
//! # Architecture
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Database                             │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Transactions (txn/) ── snapshot isolation over MVVs (mvcc/)  │
//! │                              ↓                                │
//! │  Cursors on named B+trees (tree/)                             │
//! │                              ↓                                │
//! │  Buffer pool: frames, claims, clock eviction (buffer/)        │
//! │          ↓                              ↓                     │
//! │  Volumes: pages, free list (storage/)   Journal: records,     │
//! │                                         copier, recovery      │
//! │                                         (journal/)            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//! ```no_run
//! use ledgerdb::{BufferSizing, BufferSpec, Config, Database, Key, VolumeSpec};
//!
//! let mut config = Config::new("/var/lib/myapp");
//! config.volumes.push(VolumeSpec::new("data.v01", "data", 16 * 1024));
//! config.buffers.push(BufferSpec {
//!     page_size: 16 * 1024,
//!     sizing: BufferSizing::Count(5000),
//! });
//!
//! let db = Database::open(config).unwrap();
//! let cursor = db.cursor("data", "greetings", true).unwrap();
//!
//! let mut txn = db.begin().unwrap();
//! let mut key = Key::new();
//! key.append_str("hello");
//! cursor.store(&txn, &key, b"world").unwrap();
//! txn.commit().unwrap();
//!
//! db.close().unwrap();
//! ```

pub mod alert;
pub mod buffer;
pub mod checkpoint;
pub mod cleanup;
pub mod common;
pub mod db;
pub mod journal;
pub mod key;
pub mod mvcc;
pub mod storage;
pub mod tree;
pub mod txn;

// Re-export the everyday surface at the crate root.
pub use common::config::{BufferSizing, BufferSpec, CommitPolicy, Config, VolumeSpec};
pub use common::{Error, JournalAddress, PageAddress, Result, Timestamp, TreeHandle, VolumeHandle};
pub use db::Database;
pub use key::{Key, KeySegment};
pub use storage::data_page::SplitPolicy;
pub use tree::{Cursor, Direction, TraverseResult};
pub use txn::Transaction;
