//! Page - the fixed-size unit of storage.
//!
//! A [`Page`] is a raw byte array of the volume's page size, the unit of I/O
//! between volumes, the journal, and the buffer pool. The size is fixed per
//! volume at creation (a power of two between 1 KiB and 16 KiB), so pages
//! carry their size at runtime rather than as a compile-time constant.

use crate::storage::page_header::PageHeader;

/// A page of data.
///
/// `Page` does not implement `Clone`; copying a page is expensive and should
/// be explicit (`copy_from`). A `#[cfg(test)]` Clone is provided for tests.
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Rebuild a page from raw bytes (journal replay, disk read).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    /// Get immutable slice of page data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable slice of page data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The page size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Zero out the entire page.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Overwrite this page's bytes from another image of the same size.
    ///
    /// # Panics
    /// Panics if the sizes differ.
    pub fn copy_from(&mut self, other: &[u8]) {
        self.data.copy_from_slice(other);
    }

    /// Read the page header.
    pub fn header(&self) -> PageHeader {
        PageHeader::from_bytes(&self.data)
    }

    /// Write a page header.
    pub fn set_header(&mut self, header: &PageHeader) {
        header.write_to(&mut self.data);
    }

    /// The right-sibling link without materializing the whole header.
    pub fn right_sibling(&self) -> crate::common::PageAddress {
        let off = PageHeader::OFFSET_RIGHT_SIBLING;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[off..off + 8]);
        crate::common::PageAddress::new(u64::from_be_bytes(b))
    }

    /// Rewrite the right-sibling link in place.
    pub fn set_right_sibling(&mut self, addr: crate::common::PageAddress) {
        let off = PageHeader::OFFSET_RIGHT_SIBLING;
        self.data[off..off + 8].copy_from_slice(&addr.0.to_be_bytes());
    }

    /// Compute and store the checksum in the header.
    ///
    /// Call this after all modifications to the page are complete.
    pub fn update_checksum(&mut self) {
        let checksum = PageHeader::compute_checksum(&self.data);
        self.data[PageHeader::OFFSET_CHECKSUM..PageHeader::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_be_bytes());
    }

    /// Verify the page checksum is valid.
    pub fn verify_checksum(&self) -> bool {
        self.header().verify_checksum(&self.data)
    }
}

// Clone only available in tests - forces explicit copying in production
#[cfg(test)]
impl Clone for Page {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_header::PageType;

    #[test]
    fn test_page_new() {
        let page = Page::new(4096);
        assert_eq!(page.size(), 4096);
        assert_eq!(page.as_slice()[0], 0);
        assert_eq!(page.as_slice()[4095], 0);
    }

    #[test]
    fn test_page_read_write() {
        let mut page = Page::new(1024);
        page.as_mut_slice()[0] = 0xFF;
        page.as_mut_slice()[1023] = 0xCD;
        assert_eq!(page.as_slice()[0], 0xFF);
        assert_eq!(page.as_slice()[1023], 0xCD);
    }

    #[test]
    fn test_page_checksum_roundtrip() {
        let mut page = Page::new(4096);
        page.set_header(&PageHeader::new(PageType::DataLeaf, 4096));
        page.as_mut_slice()[100] = 0x42;
        page.update_checksum();
        assert!(page.verify_checksum());

        page.as_mut_slice()[100] = 0x43;
        assert!(!page.verify_checksum());
    }

    #[test]
    fn test_page_from_bytes() {
        let mut src = Page::new(2048);
        src.as_mut_slice()[7] = 0x77;
        let copy = Page::from_bytes(src.as_slice());
        assert_eq!(copy.size(), 2048);
        assert_eq!(copy.as_slice()[7], 0x77);
    }
}
