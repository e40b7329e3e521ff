//! Journal record wire format.
//!
//! Every record begins with a fixed header, all integers big-endian:
//!
//! ```text
//! [u32 length | u16 kind | u16 checksum | u64 timestamp | payload...]
//! ```
//!
//! `length` covers the whole record including the header. `kind` is two
//! ASCII characters. `checksum` is the record's CRC32 (computed with the
//! checksum field zeroed) folded to 16 bits. Readers stop at the first
//! record whose length or checksum does not validate; during recovery that
//! truncates replay.
//!
//! Record kinds:
//! - `JH` - journal file header, first record of every file
//! - `IV` / `IT` - bind volume / tree handles to identities for this journal
//! - `PA` - full page image
//! - `TS` / `TC` - transaction start / commit
//! - `SR` / `DR` / `DT` - store / delete-range / delete-tree redo records
//! - `CP` - checkpoint

use crate::common::{Error, JournalAddress, PageAddress, Result, Timestamp, TreeHandle, VolumeHandle};

/// Bytes in the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Journal format version written in JH records.
pub const JOURNAL_VERSION: u32 = 1;

const fn kind_code(tag: &[u8; 2]) -> u16 {
    ((tag[0] as u16) << 8) | tag[1] as u16
}

/// Record kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordKind {
    JournalHeader = kind_code(b"JH"),
    IdentifyVolume = kind_code(b"IV"),
    IdentifyTree = kind_code(b"IT"),
    PageImage = kind_code(b"PA"),
    TxStart = kind_code(b"TS"),
    TxCommit = kind_code(b"TC"),
    Store = kind_code(b"SR"),
    DeleteRange = kind_code(b"DR"),
    DeleteTree = kind_code(b"DT"),
    Checkpoint = kind_code(b"CP"),
}

impl RecordKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            x if x == kind_code(b"JH") => Some(Self::JournalHeader),
            x if x == kind_code(b"IV") => Some(Self::IdentifyVolume),
            x if x == kind_code(b"IT") => Some(Self::IdentifyTree),
            x if x == kind_code(b"PA") => Some(Self::PageImage),
            x if x == kind_code(b"TS") => Some(Self::TxStart),
            x if x == kind_code(b"TC") => Some(Self::TxCommit),
            x if x == kind_code(b"SR") => Some(Self::Store),
            x if x == kind_code(b"DR") => Some(Self::DeleteRange),
            x if x == kind_code(b"DT") => Some(Self::DeleteTree),
            x if x == kind_code(b"CP") => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: Timestamp,
    pub payload: RecordPayload,
}

/// Typed payloads. The header timestamp carries the record's primary
/// timestamp: page version for `PA`, start timestamp for `TS`/`TC`/`SR`/
/// `DR`/`DT`, checkpoint timestamp for `CP`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    JournalHeader {
        version: u32,
        block_size: u64,
        base_address: JournalAddress,
        file_start: JournalAddress,
    },
    IdentifyVolume {
        volume: VolumeHandle,
        id: u64,
        created_at: u64,
        name: String,
    },
    IdentifyTree {
        tree: TreeHandle,
        volume: VolumeHandle,
        name: String,
    },
    PageImage {
        volume: VolumeHandle,
        page: PageAddress,
        image: Vec<u8>,
    },
    TxStart,
    TxCommit {
        commit_ts: Timestamp,
    },
    Store {
        tree: TreeHandle,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteRange {
        tree: TreeHandle,
        low: Vec<u8>,
        high: Vec<u8>,
    },
    DeleteTree {
        tree: TreeHandle,
    },
    Checkpoint {
        base_address: JournalAddress,
        /// `(start_ts, ts_record_addr)` of transactions active at the
        /// checkpoint.
        active: Vec<(Timestamp, JournalAddress)>,
    },
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::JournalHeader { .. } => RecordKind::JournalHeader,
            RecordPayload::IdentifyVolume { .. } => RecordKind::IdentifyVolume,
            RecordPayload::IdentifyTree { .. } => RecordKind::IdentifyTree,
            RecordPayload::PageImage { .. } => RecordKind::PageImage,
            RecordPayload::TxStart => RecordKind::TxStart,
            RecordPayload::TxCommit { .. } => RecordKind::TxCommit,
            RecordPayload::Store { .. } => RecordKind::Store,
            RecordPayload::DeleteRange { .. } => RecordKind::DeleteRange,
            RecordPayload::DeleteTree { .. } => RecordKind::DeleteTree,
            RecordPayload::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }
}

fn fold_crc(crc: u32) -> u16 {
    ((crc & 0xFFFF) ^ (crc >> 16)) as u16
}

fn record_checksum(bytes: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..6]);
    hasher.update(&[0u8; 2]);
    hasher.update(&bytes[8..]);
    fold_crc(hasher.finalize())
}

// ----------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------

struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn sized(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        self
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }
}

/// Encode a record to its wire form.
pub fn encode(timestamp: Timestamp, payload: &RecordPayload) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    match payload {
        RecordPayload::JournalHeader {
            version,
            block_size,
            base_address,
            file_start,
        } => {
            w.u32(*version).u64(*block_size).u64(base_address.0).u64(file_start.0);
        }
        RecordPayload::IdentifyVolume {
            volume,
            id,
            created_at,
            name,
        } => {
            w.u32(volume.0).u64(*id).u64(*created_at).sized(name.as_bytes());
        }
        RecordPayload::IdentifyTree { tree, volume, name } => {
            w.u32(tree.0).u32(volume.0).sized(name.as_bytes());
        }
        RecordPayload::PageImage { volume, page, image } => {
            w.u32(volume.0).u64(page.0).raw(image);
        }
        RecordPayload::TxStart => {}
        RecordPayload::TxCommit { commit_ts } => {
            w.u64(commit_ts.0);
        }
        RecordPayload::Store { tree, key, value } => {
            w.u32(tree.0).sized(key).raw(value);
        }
        RecordPayload::DeleteRange { tree, low, high } => {
            w.u32(tree.0).sized(low).sized(high);
        }
        RecordPayload::DeleteTree { tree } => {
            w.u32(tree.0);
        }
        RecordPayload::Checkpoint {
            base_address,
            active,
        } => {
            w.u64(base_address.0).u32(active.len() as u32);
            for (ts, addr) in active {
                w.u64(ts.0).u64(addr.0);
            }
        }
    }

    let payload_bytes = w.buf;
    let length = (RECORD_HEADER_SIZE + payload_bytes.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&(payload.kind() as u16).to_be_bytes());
    out.extend_from_slice(&[0u8; 2]); // checksum patched below
    out.extend_from_slice(&timestamp.0.to_be_bytes());
    out.extend_from_slice(&payload_bytes);

    let checksum = record_checksum(&out);
    out[6..8].copy_from_slice(&checksum.to_be_bytes());
    out
}

// ----------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    addr: JournalAddress,
}

impl<'a> PayloadReader<'a> {
    fn corrupt(&self) -> Error {
        Error::CorruptJournal(self.addr)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(self.corrupt());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn sized_string(&mut self) -> Result<String> {
        let bytes = self.sized()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt())
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Decode one record at the front of `buf` (located at journal address
/// `addr`, for error reporting). Returns the record and the bytes it
/// consumed. `Ok(None)` means the buffer ends cleanly before another
/// header could start (fewer than `RECORD_HEADER_SIZE` bytes remain or the
/// length field is zero).
pub fn decode(buf: &[u8], addr: JournalAddress) -> Result<Option<(Record, usize)>> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length == 0 {
        return Ok(None); // zero fill after the last record of a file
    }
    if length < RECORD_HEADER_SIZE || length > buf.len() {
        return Err(Error::CorruptJournal(addr));
    }
    let record_bytes = &buf[..length];

    let stored_checksum = u16::from_be_bytes([buf[6], buf[7]]);
    if stored_checksum != record_checksum(record_bytes) {
        return Err(Error::CorruptJournal(addr));
    }

    let kind = RecordKind::from_u16(u16::from_be_bytes([buf[4], buf[5]]))
        .ok_or(Error::CorruptJournal(addr))?;
    let timestamp = {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[8..16]);
        Timestamp::new(u64::from_be_bytes(arr))
    };

    let mut r = PayloadReader {
        buf: &record_bytes[RECORD_HEADER_SIZE..],
        pos: 0,
        addr,
    };

    let payload = match kind {
        RecordKind::JournalHeader => RecordPayload::JournalHeader {
            version: r.u32()?,
            block_size: r.u64()?,
            base_address: JournalAddress::new(r.u64()?),
            file_start: JournalAddress::new(r.u64()?),
        },
        RecordKind::IdentifyVolume => RecordPayload::IdentifyVolume {
            volume: VolumeHandle::new(r.u32()?),
            id: r.u64()?,
            created_at: r.u64()?,
            name: r.sized_string()?,
        },
        RecordKind::IdentifyTree => RecordPayload::IdentifyTree {
            tree: TreeHandle::new(r.u32()?),
            volume: VolumeHandle::new(r.u32()?),
            name: r.sized_string()?,
        },
        RecordKind::PageImage => RecordPayload::PageImage {
            volume: VolumeHandle::new(r.u32()?),
            page: PageAddress::new(r.u64()?),
            image: r.rest().to_vec(),
        },
        RecordKind::TxStart => RecordPayload::TxStart,
        RecordKind::TxCommit => RecordPayload::TxCommit {
            commit_ts: Timestamp::new(r.u64()?),
        },
        RecordKind::Store => RecordPayload::Store {
            tree: TreeHandle::new(r.u32()?),
            key: r.sized()?.to_vec(),
            value: r.rest().to_vec(),
        },
        RecordKind::DeleteRange => RecordPayload::DeleteRange {
            tree: TreeHandle::new(r.u32()?),
            low: r.sized()?.to_vec(),
            high: r.sized()?.to_vec(),
        },
        RecordKind::DeleteTree => RecordPayload::DeleteTree {
            tree: TreeHandle::new(r.u32()?),
        },
        RecordKind::Checkpoint => {
            let base_address = JournalAddress::new(r.u64()?);
            let count = r.u32()? as usize;
            let mut active = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                active.push((Timestamp::new(r.u64()?), JournalAddress::new(r.u64()?)));
            }
            RecordPayload::Checkpoint {
                base_address,
                active,
            }
        }
    };

    Ok(Some((Record { timestamp, payload }, length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ts: u64, payload: RecordPayload) {
        let bytes = encode(Timestamp::new(ts), &payload);
        let (record, consumed) = decode(&bytes, JournalAddress::ZERO).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(record.timestamp, Timestamp::new(ts));
        assert_eq!(record.payload, payload);
    }

    #[test]
    fn test_roundtrip_every_kind() {
        roundtrip(
            1,
            RecordPayload::JournalHeader {
                version: JOURNAL_VERSION,
                block_size: 1_000_000_000,
                base_address: JournalAddress::new(10),
                file_start: JournalAddress::new(20),
            },
        );
        roundtrip(
            0,
            RecordPayload::IdentifyVolume {
                volume: VolumeHandle::new(1),
                id: 0xDEAD,
                created_at: 12345,
                name: "data".into(),
            },
        );
        roundtrip(
            0,
            RecordPayload::IdentifyTree {
                tree: TreeHandle::new(2),
                volume: VolumeHandle::new(1),
                name: "accounts".into(),
            },
        );
        roundtrip(
            42,
            RecordPayload::PageImage {
                volume: VolumeHandle::new(1),
                page: PageAddress::new(9),
                image: vec![0xAB; 128],
            },
        );
        roundtrip(5, RecordPayload::TxStart);
        roundtrip(
            5,
            RecordPayload::TxCommit {
                commit_ts: Timestamp::new(9),
            },
        );
        roundtrip(
            5,
            RecordPayload::Store {
                tree: TreeHandle::new(2),
                key: b"key".to_vec(),
                value: b"value".to_vec(),
            },
        );
        roundtrip(
            5,
            RecordPayload::DeleteRange {
                tree: TreeHandle::new(2),
                low: b"a".to_vec(),
                high: b"z".to_vec(),
            },
        );
        roundtrip(5, RecordPayload::DeleteTree { tree: TreeHandle::new(2) });
        roundtrip(
            77,
            RecordPayload::Checkpoint {
                base_address: JournalAddress::new(4096),
                active: vec![
                    (Timestamp::new(70), JournalAddress::new(100)),
                    (Timestamp::new(75), JournalAddress::new(200)),
                ],
            },
        );
    }

    #[test]
    fn test_corrupt_checksum_detected() {
        let mut bytes = encode(Timestamp::new(5), &RecordPayload::TxStart);
        let last = bytes.len() - 1;
        bytes.extend_from_slice(&[0u8; 4]); // make room so length still fits
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode(&bytes, JournalAddress::new(7)),
            Err(Error::CorruptJournal(JournalAddress(7)))
        ));
    }

    #[test]
    fn test_bad_length_detected() {
        let mut bytes = encode(Timestamp::new(5), &RecordPayload::TxStart);
        bytes[0..4].copy_from_slice(&3u32.to_be_bytes());
        assert!(decode(&bytes, JournalAddress::ZERO).is_err());
    }

    #[test]
    fn test_zero_fill_ends_cleanly() {
        assert_eq!(decode(&[0u8; 64], JournalAddress::ZERO).unwrap(), None);
        assert_eq!(decode(&[0u8; 4], JournalAddress::ZERO).unwrap(), None);
    }

    #[test]
    fn test_back_to_back_records() {
        let a = encode(Timestamp::new(1), &RecordPayload::TxStart);
        let b = encode(
            Timestamp::new(1),
            &RecordPayload::TxCommit {
                commit_ts: Timestamp::new(2),
            },
        );
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let (first, consumed) = decode(&stream, JournalAddress::ZERO).unwrap().unwrap();
        assert_eq!(first.payload, RecordPayload::TxStart);
        let (second, _) = decode(&stream[consumed..], JournalAddress::new(consumed as u64))
            .unwrap()
            .unwrap();
        assert!(matches!(second.payload, RecordPayload::TxCommit { .. }));
    }
}
