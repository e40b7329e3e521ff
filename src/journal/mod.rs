//! The write-ahead journal: the sole source of durability.
//!
//! - [`record`] - record wire format
//! - [`JournalManager`] - append path, addresses, rollover, force
//! - [`Copier`] - dirty-page write-back and base advance
//! - [`RecoveryManager`] - journal scan and replay planning

pub mod record;
mod copier;
mod manager;
mod recovery;

pub use copier::Copier;
pub use manager::{list_journal_files, JournalManager, JournalPositions, JournalStats};
pub use recovery::{LogicalRef, RecoveryManager, RecoveryPlan, RecoveryReport};
