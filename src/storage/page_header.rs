//! Page header and type definitions.
//!
//! Every page starts with a [`PageHeader`] containing metadata:
//! - [`PageType`] discriminator
//! - CRC32 checksum for integrity
//! - version timestamp of the last modification
//! - right-sibling pointer (leaf chain, long-record chain, free list)

use crate::common::{PageAddress, Timestamp};

/// Type of page stored on disk.
///
/// Uses `#[repr(u8)]` to guarantee a 1-byte representation for serialization.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Uninitialized or corrupted page.
    #[default]
    Invalid = 0,
    /// Volume head page (page 0 only).
    Head = 1,
    /// B+tree interior node.
    DataInterior = 2,
    /// B+tree leaf node.
    DataLeaf = 3,
    /// One link of a long-record chain.
    LongRecord = 4,
    /// Page on the volume free list.
    Garbage = 5,
}

impl PageType {
    /// Convert from u8, returning Invalid for unknown values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Head,
            2 => PageType::DataInterior,
            3 => PageType::DataLeaf,
            4 => PageType::LongRecord,
            5 => PageType::Garbage,
            _ => PageType::Invalid,
        }
    }

    /// True for pages that hold slot/record data.
    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, PageType::DataInterior | PageType::DataLeaf)
    }
}

/// Metadata stored at the beginning of every page.
///
/// # Layout (32 bytes, big-endian)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     page_type (PageType as u8)
/// 1       1     reserved
/// 2       2     slot_count
/// 4       4     checksum (CRC32)
/// 8       8     timestamp (version of last modification)
/// 16      8     right_sibling (page address; 0 = none)
/// 24      4     heap_offset (low-water mark of the record heap)
/// 28      4     garbage_bytes (reclaimable by compaction)
/// ```
///
/// The checksum is computed over the entire page with the checksum field
/// itself zeroed, so verification needs no special carve-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub slot_count: u16,
    pub checksum: u32,
    pub timestamp: Timestamp,
    pub right_sibling: PageAddress,
    pub heap_offset: u32,
    pub garbage_bytes: u32,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    pub const OFFSET_PAGE_TYPE: usize = 0;
    pub const OFFSET_SLOT_COUNT: usize = 2;
    pub const OFFSET_CHECKSUM: usize = 4;
    pub const OFFSET_TIMESTAMP: usize = 8;
    pub const OFFSET_RIGHT_SIBLING: usize = 16;
    pub const OFFSET_HEAP_OFFSET: usize = 24;
    pub const OFFSET_GARBAGE_BYTES: usize = 28;

    /// Create a new header for an empty page of `page_size` bytes.
    pub fn new(page_type: PageType, page_size: usize) -> Self {
        Self {
            page_type,
            slot_count: 0,
            checksum: 0,
            timestamp: Timestamp::ZERO,
            right_sibling: PageAddress::NULL,
            heap_offset: page_size as u32,
            garbage_bytes: 0,
        }
    }

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        let u16_at = |off: usize| u16::from_be_bytes([data[off], data[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[off..off + 8]);
            u64::from_be_bytes(b)
        };

        Self {
            page_type: PageType::from_u8(data[Self::OFFSET_PAGE_TYPE]),
            slot_count: u16_at(Self::OFFSET_SLOT_COUNT),
            checksum: u32_at(Self::OFFSET_CHECKSUM),
            timestamp: Timestamp::new(u64_at(Self::OFFSET_TIMESTAMP)),
            right_sibling: PageAddress::new(u64_at(Self::OFFSET_RIGHT_SIBLING)),
            heap_offset: u32_at(Self::OFFSET_HEAP_OFFSET),
            garbage_bytes: u32_at(Self::OFFSET_GARBAGE_BYTES),
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        data[Self::OFFSET_PAGE_TYPE] = self.page_type as u8;
        data[1] = 0;
        data[Self::OFFSET_SLOT_COUNT..Self::OFFSET_SLOT_COUNT + 2]
            .copy_from_slice(&self.slot_count.to_be_bytes());
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_be_bytes());
        data[Self::OFFSET_TIMESTAMP..Self::OFFSET_TIMESTAMP + 8]
            .copy_from_slice(&self.timestamp.0.to_be_bytes());
        data[Self::OFFSET_RIGHT_SIBLING..Self::OFFSET_RIGHT_SIBLING + 8]
            .copy_from_slice(&self.right_sibling.0.to_be_bytes());
        data[Self::OFFSET_HEAP_OFFSET..Self::OFFSET_HEAP_OFFSET + 4]
            .copy_from_slice(&self.heap_offset.to_be_bytes());
        data[Self::OFFSET_GARBAGE_BYTES..Self::OFFSET_GARBAGE_BYTES + 4]
            .copy_from_slice(&self.garbage_bytes.to_be_bytes());
    }

    /// Compute the CRC32 checksum of a page with the checksum field zeroed.
    pub fn compute_checksum(page_data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_data[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page_data[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Verify that the stored checksum matches the computed checksum.
    pub fn verify_checksum(&self, page_data: &[u8]) -> bool {
        self.checksum == Self::compute_checksum(page_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_from_u8() {
        assert_eq!(PageType::from_u8(0), PageType::Invalid);
        assert_eq!(PageType::from_u8(1), PageType::Head);
        assert_eq!(PageType::from_u8(2), PageType::DataInterior);
        assert_eq!(PageType::from_u8(3), PageType::DataLeaf);
        assert_eq!(PageType::from_u8(4), PageType::LongRecord);
        assert_eq!(PageType::from_u8(5), PageType::Garbage);
        assert_eq!(PageType::from_u8(255), PageType::Invalid);
    }

    #[test]
    fn test_header_roundtrip() {
        let original = PageHeader {
            page_type: PageType::DataLeaf,
            slot_count: 17,
            checksum: 0xDEADBEEF,
            timestamp: Timestamp::new(0x0123_4567_89AB_CDEF),
            right_sibling: PageAddress::new(99),
            heap_offset: 4000,
            garbage_bytes: 120,
        };

        let mut buffer = [0u8; PageHeader::SIZE];
        original.write_to(&mut buffer);

        let recovered = PageHeader::from_bytes(&buffer);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut page_data = vec![0u8; 4096];
        page_data[100] = 0xAB;

        let checksum1 = PageHeader::compute_checksum(&page_data);
        page_data[PageHeader::OFFSET_CHECKSUM] = 0xFF;
        let checksum2 = PageHeader::compute_checksum(&page_data);
        assert_eq!(checksum1, checksum2);

        page_data[100] = 0xAC;
        assert_ne!(checksum1, PageHeader::compute_checksum(&page_data));
    }

    #[test]
    fn test_new_header_heap_offset() {
        let header = PageHeader::new(PageType::DataLeaf, 4096);
        assert_eq!(header.heap_offset, 4096);
        assert_eq!(header.slot_count, 0);
        assert_eq!(header.right_sibling, PageAddress::NULL);
    }
}
