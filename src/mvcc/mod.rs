//! Multi-version concurrency control.
//!
//! - [`mvv`] - the in-page multi-version value encoding, visibility rule,
//!   write-write conflict detection, and pruning
//! - [`TransactionStatus`] - start/commit state of one transaction
//! - [`TransactionIndex`] - the status slab, hashed buckets, and the
//!   active-transaction cache

pub mod mvv;
mod index;
mod status;

pub use index::{IndexDepths, TransactionIndex, TxHandle};
pub use mvv::{Disposition, Pruned};
pub use status::TransactionStatus;
