//! Typed identifiers used across the engine.
//!
//! Plain integers wrapped in newtypes so a page address can never be handed
//! to an API expecting a journal address. All of them are cheap `Copy` types.

use std::fmt;

/// Address of a page within a volume file, in page-size units.
///
/// Page 0 is the volume head page; it is never linked into a tree, so 0
/// doubles as the "no page" sentinel for sibling and child pointers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageAddress(pub u64);

impl PageAddress {
    /// The "no page" sentinel (the head page can never be a link target).
    pub const NULL: PageAddress = PageAddress(0);

    #[inline]
    pub fn new(addr: u64) -> Self {
        PageAddress(addr)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({})", self.0)
    }
}

/// Identifies a volume within this engine instance.
///
/// Handles are assigned in open order and bound to the volume's persistent
/// identity by IV records in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeHandle(pub u32);

impl VolumeHandle {
    #[inline]
    pub fn new(h: u32) -> Self {
        VolumeHandle(h)
    }
}

impl fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Volume({})", self.0)
    }
}

/// Identifies a tree within this engine instance.
///
/// Bound to (volume, tree name) by IT records in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeHandle(pub u32);

impl TreeHandle {
    #[inline]
    pub fn new(h: u32) -> Self {
        TreeHandle(h)
    }
}

impl fmt::Display for TreeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree({})", self.0)
    }
}

/// A byte offset into the journal stream.
///
/// Journal addresses are global: they increase monotonically across file
/// rollovers, so an address uniquely names one byte for the lifetime of the
/// journal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JournalAddress(pub u64);

impl JournalAddress {
    pub const ZERO: JournalAddress = JournalAddress(0);

    #[inline]
    pub fn new(addr: u64) -> Self {
        JournalAddress(addr)
    }

    #[inline]
    pub fn checked_add(self, len: u64) -> JournalAddress {
        JournalAddress(self.0.checked_add(len).expect("journal address overflow"))
    }
}

impl fmt::Display for JournalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JournalAddress({})", self.0)
    }
}
