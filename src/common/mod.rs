//! Common types and utilities shared across ledgerdb.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration structures and bounds
//! - Error types
//! - Typed identifiers (PageAddress, VolumeHandle, TreeHandle, JournalAddress)
//! - The engine-wide timestamp source

pub mod config;
pub mod error;
mod handles;
mod timestamp;

pub use config::{BufferSizing, BufferSpec, CommitPolicy, Config, VolumeSpec};
pub use error::{Error, Result};
pub use handles::{JournalAddress, PageAddress, TreeHandle, VolumeHandle};
pub use timestamp::{Timestamp, TimestampSource};
