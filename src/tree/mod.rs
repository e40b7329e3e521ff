//! Named B+trees and the per-volume directory tree.
//!
//! A [`Tree`] is a named B+tree within a volume, identified by its root
//! page. Roots are fixed for the life of a tree: a root split grows the
//! tree *downward* by moving both halves into fresh children, so nothing
//! that refers to a tree (directory entries, cursors) ever needs updating.
//!
//! Every volume carries a hidden directory tree, bootstrapped at volume
//! creation, that maps tree name → root page address. Directory content is
//! ordinary page data: it reaches the journal through page images like any
//! other page, and tree existence is additionally pinned by IT records so
//! recovery can recreate a tree the directory pages had not yet captured.

mod cursor;

pub use cursor::{Cursor, Direction, TraverseResult};

use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::cleanup::CleanupManager;
use crate::common::{Error, PageAddress, Result, TimestampSource, TreeHandle, VolumeHandle};
use crate::journal::JournalManager;
use crate::key::Key;
use crate::mvcc::TransactionIndex;
use crate::storage::data_page::{self, DataPageMut};
use crate::storage::{PageType, Volume};

/// Everything a cursor needs to operate on one volume's trees.
pub struct TreeContext {
    pub pool: Arc<BufferPool>,
    pub volume: Arc<Volume>,
    pub journal: Arc<JournalManager>,
    pub tx_index: Arc<TransactionIndex>,
    pub cleanup: Arc<CleanupManager>,
    pub timestamps: Arc<TimestampSource>,
    /// Ceiling on an encoded key for this volume's page size.
    pub max_key_size: usize,
    /// Ceiling on a value.
    pub max_value_size: usize,
    /// False while recovery replays logical records (their journal entries
    /// already exist).
    pub journaling: bool,
}

impl TreeContext {
    /// Derive the effective key ceiling from the configured one and the
    /// page-derived one.
    pub fn effective_max_key(config_max: usize, page_size: usize) -> usize {
        config_max.min(data_page::max_key_for_page(page_size))
    }
}

/// A named B+tree. Cheap to copy; the root address is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub handle: TreeHandle,
    pub name: String,
    pub volume: VolumeHandle,
    pub root: PageAddress,
}

/// Name of the hidden directory tree (not addressable by clients).
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// The directory tree of a volume.
pub fn directory_tree(volume: &Volume) -> Tree {
    Tree {
        handle: TreeHandle::new(0),
        name: DIRECTORY_TREE_NAME.to_string(),
        volume: volume.handle(),
        root: volume.directory_root(),
    }
}

fn directory_key(name: &str) -> Key {
    let mut key = Key::new();
    key.append_str(name);
    key
}

/// Look up a tree by name in the volume's directory.
pub fn lookup_tree(ctx: &Arc<TreeContext>, name: &str, handle: TreeHandle) -> Result<Option<Tree>> {
    let directory = Cursor::new(Arc::clone(ctx), directory_tree(&ctx.volume));
    let key = directory_key(name);
    match directory.system_fetch(key.encoded())? {
        Some(bytes) if bytes.len() == 8 => {
            let mut addr = [0u8; 8];
            addr.copy_from_slice(&bytes);
            Ok(Some(Tree {
                handle,
                name: name.to_string(),
                volume: ctx.volume.handle(),
                root: PageAddress::new(u64::from_be_bytes(addr)),
            }))
        }
        Some(_) => Err(Error::Config(format!(
            "directory entry for {:?} is malformed",
            name
        ))),
        None => Ok(None),
    }
}

/// Create a tree: allocate its root leaf and record it in the directory.
/// The caller serializes concurrent creations of the same name.
pub fn create_tree(ctx: &Arc<TreeContext>, name: &str, handle: TreeHandle) -> Result<Tree> {
    let ts = ctx.timestamps.next();
    let root = {
        let (root, mut guard) = ctx.pool.new_page(&ctx.volume)?;
        DataPageMut::init(&mut guard, PageType::DataLeaf, ts);
        guard.set_version(ts);
        root
    };

    let directory = Cursor::new(Arc::clone(ctx), directory_tree(&ctx.volume));
    let key = directory_key(name);
    directory.system_store(key.encoded(), &root.0.to_be_bytes(), ts)?;

    Ok(Tree {
        handle,
        name: name.to_string(),
        volume: ctx.volume.handle(),
        root,
    })
}

/// Tree names recorded in a volume's directory, in order.
pub fn list_trees(ctx: &Arc<TreeContext>) -> Result<Vec<String>> {
    let directory = Cursor::new(Arc::clone(ctx), directory_tree(&ctx.volume));
    let mut names = Vec::new();
    let mut position = Key::before();
    while let Some((key, _)) = directory.system_traverse(&position, Direction::Gt, true)? {
        if let Some(Ok(crate::key::KeySegment::String(name))) = key.segments().next() {
            names.push(name);
        }
        position = key;
    }
    Ok(names)
}

/// Remove a tree: delete its directory entry and return every page it
/// occupied (including long-record chains) to the volume free list.
pub fn remove_tree(ctx: &Arc<TreeContext>, tree: &Tree) -> Result<()> {
    let directory = Cursor::new(Arc::clone(ctx), directory_tree(&ctx.volume));
    let key = directory_key(&tree.name);
    let ts = ctx.timestamps.next();
    directory.system_remove(key.encoded(), ts)?;

    let tree_cursor = Cursor::new(Arc::clone(ctx), tree.clone());
    let pages = tree_cursor.collect_tree_pages()?;
    for addr in pages {
        // the root page itself is freed last and stays formatted: the tree
        // is gone once the directory entry is
        ctx.pool.invalidate((ctx.volume.handle(), addr));
        ctx.volume.free(addr, ts)?;
    }
    Ok(())
}
