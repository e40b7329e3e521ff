//! Volume - a single file of pages.
//!
//! A volume holds a head page (page 0) carrying the volume's identity and
//! bootstrap pointers, a free-page list threaded through garbage pages, and
//! the page-addressable store for every tree that lives in the volume.
//!
//! # File Layout
//! ```text
//! ┌──────────┬─────────┬─────────┬─────────┐
//! │ Head (0) │ Page 1  │ Page 2  │  ...    │
//! └──────────┴─────────┴─────────┴─────────┘
//! ```
//! Page N is located at file offset `N × page_size`. The file is extended in
//! `extension_pages` increments up to `maximum_pages`.
//!
//! # Exclusivity
//! An OS advisory lock (`fs2`) is taken on the file at open; a second engine
//! instance opening the same volume fails at initialization.
//!
//! # Durability
//! `write_page` does not sync; the copier and checkpoint call [`Volume::sync`]
//! after a batch. A page must already be durable in the journal before it is
//! written here.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::debug;
use parking_lot::Mutex;

use crate::common::config::VolumeSpec;
use crate::common::{Error, PageAddress, Result, Timestamp, VolumeHandle};
use crate::storage::page::Page;
use crate::storage::page_header::{PageHeader, PageType};

const VOLUME_MAGIC: u64 = 0x4C44_425F_564F_4C31; // "LDB_VOL1"
const VOLUME_VERSION: u32 = 1;

/// Head-page fields beyond the common page header.
const OFFSET_MAGIC: usize = 32;
const OFFSET_VERSION: usize = 40;
const OFFSET_PAGE_SIZE: usize = 44;
const OFFSET_PAGE_COUNT: usize = 48;
const OFFSET_DIRECTORY_ROOT: usize = 56;
const OFFSET_FREE_LIST_HEAD: usize = 64;
const OFFSET_VOLUME_ID: usize = 72;
const OFFSET_CREATED_AT: usize = 80;

/// Mutable head-page state, guarded by one lock.
#[derive(Debug, Clone, Copy)]
struct HeadState {
    /// Next never-allocated page address (high-water mark).
    page_count: u64,
    /// Root page of the hidden directory tree.
    directory_root: PageAddress,
    /// First page of the free list; 0 when empty.
    free_list_head: PageAddress,
}

/// Persistent identity of a volume, stable across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeIdentity {
    pub id: u64,
    pub created_at: u64,
}

/// A single volume file.
pub struct Volume {
    handle: VolumeHandle,
    name: String,
    path: PathBuf,
    page_size: usize,
    extension_pages: u64,
    maximum_pages: u64,
    identity: VolumeIdentity,
    file: Mutex<File>,
    head: Mutex<HeadState>,
}

impl Volume {
    /// Create the volume file described by `spec`, or open it when it
    /// already exists; a missing file with `create` disabled is a
    /// configuration error.
    pub fn open_or_create(
        path: &Path,
        spec: &VolumeSpec,
        handle: VolumeHandle,
    ) -> Result<Volume> {
        if path.exists() {
            Self::open(path, spec, handle)
        } else if spec.create {
            Self::create(path, spec, handle)
        } else {
            Err(Error::Config(format!(
                "volume {:?} does not exist and create is disabled",
                spec.name
            )))
        }
    }

    fn create(path: &Path, spec: &VolumeSpec, handle: VolumeHandle) -> Result<Volume> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::VolumeInUse(path.to_path_buf()))?;

        let identity = VolumeIdentity {
            id: fresh_volume_id(),
            created_at: unix_seconds(),
        };

        let volume = Volume {
            handle,
            name: spec.name.clone(),
            path: path.to_path_buf(),
            page_size: spec.page_size,
            extension_pages: spec.extension_pages,
            maximum_pages: spec.maximum_pages,
            identity,
            file: Mutex::new(file),
            head: Mutex::new(HeadState {
                page_count: 1,
                directory_root: PageAddress::NULL,
                free_list_head: PageAddress::NULL,
            }),
        };

        // reserve the initial extent, then bootstrap the directory tree root
        volume.extend_to(spec.initial_pages)?;
        let root = volume.allocate()?;
        let mut root_page = Page::new(spec.page_size);
        crate::storage::data_page::DataPageMut::init(
            &mut root_page,
            PageType::DataLeaf,
            Timestamp::ZERO,
        );
        volume.write_page(root, &mut root_page)?;
        volume.head.lock().directory_root = root;

        volume.write_head()?;
        volume.sync()?;
        debug!("created volume {:?} at {:?}", spec.name, path);
        Ok(volume)
    }

    fn open(path: &Path, spec: &VolumeSpec, handle: VolumeHandle) -> Result<Volume> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::VolumeInUse(path.to_path_buf()))?;

        let mut head_bytes = vec![0u8; spec.page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head_bytes)?;

        let header = PageHeader::from_bytes(&head_bytes);
        if header.page_type != PageType::Head || !header.verify_checksum(&head_bytes) {
            return Err(Error::CorruptPage {
                volume: handle,
                page: PageAddress::new(0),
            });
        }

        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&head_bytes[off..off + 8]);
            u64::from_be_bytes(b)
        };
        let u32_at = |off: usize| {
            u32::from_be_bytes([
                head_bytes[off],
                head_bytes[off + 1],
                head_bytes[off + 2],
                head_bytes[off + 3],
            ])
        };

        if u64_at(OFFSET_MAGIC) != VOLUME_MAGIC {
            return Err(Error::Config(format!("{:?} is not a volume file", path)));
        }
        if u32_at(OFFSET_VERSION) != VOLUME_VERSION {
            return Err(Error::Config(format!(
                "volume {:?} has unsupported version {}",
                path,
                u32_at(OFFSET_VERSION)
            )));
        }
        let page_size = u32_at(OFFSET_PAGE_SIZE) as usize;
        if page_size != spec.page_size {
            return Err(Error::Config(format!(
                "volume {:?} has page size {}, configuration says {}",
                path, page_size, spec.page_size
            )));
        }

        let volume = Volume {
            handle,
            name: spec.name.clone(),
            path: path.to_path_buf(),
            page_size,
            extension_pages: spec.extension_pages,
            maximum_pages: spec.maximum_pages,
            identity: VolumeIdentity {
                id: u64_at(OFFSET_VOLUME_ID),
                created_at: u64_at(OFFSET_CREATED_AT),
            },
            file: Mutex::new(file),
            head: Mutex::new(HeadState {
                page_count: u64_at(OFFSET_PAGE_COUNT),
                directory_root: PageAddress::new(u64_at(OFFSET_DIRECTORY_ROOT)),
                free_list_head: PageAddress::new(u64_at(OFFSET_FREE_LIST_HEAD)),
            }),
        };
        debug!("opened volume {:?}: {} pages", spec.name, volume.page_count());
        Ok(volume)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn handle(&self) -> VolumeHandle {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn identity(&self) -> VolumeIdentity {
        self.identity
    }

    /// High-water page count (head page included).
    pub fn page_count(&self) -> u64 {
        self.head.lock().page_count
    }

    pub fn directory_root(&self) -> PageAddress {
        self.head.lock().directory_root
    }

    pub fn set_directory_root(&self, root: PageAddress) {
        self.head.lock().directory_root = root;
    }

    // ------------------------------------------------------------------
    // Page I/O
    // ------------------------------------------------------------------

    /// Read a page. A page inside the file extent that was never written
    /// reads back as an all-zero (Invalid) page; that is not an error.
    pub fn read_page(&self, addr: PageAddress) -> Result<Page> {
        {
            let head = self.head.lock();
            if addr.0 >= head.page_count {
                return Err(Error::PageNotFound {
                    volume: self.handle,
                    page: addr,
                });
            }
        }

        let mut page = Page::new(self.page_size);
        let offset = addr.0 * self.page_size as u64;
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            // allocated past the physical extent; reads as empty
            return Ok(page);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(page.as_mut_slice()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ShortRead {
                    volume: self.handle,
                    page: addr,
                }
            } else {
                Error::Io(e)
            }
        })?;
        drop(file);

        let header = page.header();
        if header.page_type == PageType::Invalid && header.checksum == 0 {
            return Ok(page); // never written
        }
        if !page.verify_checksum() {
            return Err(Error::CorruptPage {
                volume: self.handle,
                page: addr,
            });
        }
        Ok(page)
    }

    /// Write a page image. Refreshes the checksum; does not sync.
    pub fn write_page(&self, addr: PageAddress, page: &mut Page) -> Result<()> {
        debug_assert_eq!(page.size(), self.page_size);
        page.update_checksum();

        let offset = addr.0 * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.as_slice())?;
        Ok(())
    }

    /// The version timestamp of the on-disk copy of `addr`, or zero when the
    /// page was never written. Recovery uses this to decide whether a
    /// journaled image is newer.
    pub fn page_timestamp(&self, addr: PageAddress) -> Result<Timestamp> {
        match self.read_page(addr) {
            Ok(page) => Ok(page.header().timestamp),
            Err(Error::PageNotFound { .. }) => Ok(Timestamp::ZERO),
            Err(e) => Err(e),
        }
    }

    /// fsync the file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a page, from the free list or by extending the high-water
    /// mark (and file, in `extension_pages` steps).
    pub fn allocate(&self) -> Result<PageAddress> {
        // try the free list first
        let free_head = self.head.lock().free_list_head;
        if !free_head.is_null() {
            let page = self.read_page(free_head)?;
            let next = page.header().right_sibling;
            let mut head = self.head.lock();
            // only pop if nobody raced us
            if head.free_list_head == free_head {
                head.free_list_head = next;
                return Ok(free_head);
            }
        }

        let addr = {
            let mut head = self.head.lock();
            if head.page_count >= self.maximum_pages {
                return Err(Error::VolumeFull(self.handle));
            }
            let addr = PageAddress::new(head.page_count);
            head.page_count += 1;
            addr
        };
        self.extend_to(addr.0 + 1)?;
        Ok(addr)
    }

    /// Return a page to the free list.
    pub fn free(&self, addr: PageAddress, timestamp: Timestamp) -> Result<()> {
        debug_assert!(!addr.is_null());
        let mut page = Page::new(self.page_size);
        let mut header = PageHeader::new(PageType::Garbage, self.page_size);
        header.timestamp = timestamp;
        header.right_sibling = self.head.lock().free_list_head;
        page.set_header(&header);
        self.write_page(addr, &mut page)?;
        self.head.lock().free_list_head = addr;
        Ok(())
    }

    /// Recovery hook: make sure the high-water mark covers `addr`.
    pub fn note_recovered_page(&self, addr: PageAddress) {
        let mut head = self.head.lock();
        if addr.0 >= head.page_count {
            head.page_count = addr.0 + 1;
        }
    }

    /// Ensure the physical file covers `pages` pages, growing in extension
    /// increments.
    fn extend_to(&self, pages: u64) -> Result<()> {
        let needed = pages * self.page_size as u64;
        let mut file = self.file.lock();
        let current = file.metadata()?.len();
        if current < needed {
            let step = self.extension_pages * self.page_size as u64;
            let target = needed.div_ceil(step) * step;
            let target = target.min(self.maximum_pages * self.page_size as u64);
            file.set_len(target.max(needed))?;
        }
        Ok(())
    }

    /// Persist the head page. Called at checkpoint and close.
    pub fn write_head(&self) -> Result<()> {
        let head = *self.head.lock();

        let mut page = Page::new(self.page_size);
        let header = PageHeader::new(PageType::Head, self.page_size);
        page.set_header(&header);

        let data = page.as_mut_slice();
        data[OFFSET_MAGIC..OFFSET_MAGIC + 8].copy_from_slice(&VOLUME_MAGIC.to_be_bytes());
        data[OFFSET_VERSION..OFFSET_VERSION + 4].copy_from_slice(&VOLUME_VERSION.to_be_bytes());
        data[OFFSET_PAGE_SIZE..OFFSET_PAGE_SIZE + 4]
            .copy_from_slice(&(self.page_size as u32).to_be_bytes());
        data[OFFSET_PAGE_COUNT..OFFSET_PAGE_COUNT + 8]
            .copy_from_slice(&head.page_count.to_be_bytes());
        data[OFFSET_DIRECTORY_ROOT..OFFSET_DIRECTORY_ROOT + 8]
            .copy_from_slice(&head.directory_root.0.to_be_bytes());
        data[OFFSET_FREE_LIST_HEAD..OFFSET_FREE_LIST_HEAD + 8]
            .copy_from_slice(&head.free_list_head.0.to_be_bytes());
        data[OFFSET_VOLUME_ID..OFFSET_VOLUME_ID + 8]
            .copy_from_slice(&self.identity.id.to_be_bytes());
        data[OFFSET_CREATED_AT..OFFSET_CREATED_AT + 8]
            .copy_from_slice(&self.identity.created_at.to_be_bytes());

        self.write_page(PageAddress::new(0), &mut page)
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A volume id that is distinct across creations with overwhelming
/// likelihood: wall-clock nanoseconds folded with the process id.
fn fresh_volume_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (std::process::id() as u64).rotate_left(32) | 1
}
