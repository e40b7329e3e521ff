//! Recovery: rebuild committed state from the journal.
//!
//! On startup the recovery manager scans the journal files:
//!
//! 1. Locate the most recent valid CP record; its address is the keystone
//!    and its payload names the base address replay must start from.
//! 2. Rebuild the **page map**: for every (volume, page) named by a PA
//!    record at or above the base, the latest record is authoritative.
//! 3. Rebuild the **transaction map**: every TS seen is committed iff a TC
//!    for the same start timestamp follows; uncommitted transactions are
//!    discarded.
//! 4. The caller (the root object) applies authoritative page images whose
//!    timestamp beats the volume's on-disk copy, then replays the logical
//!    records of committed transactions in journal order.
//!
//! Scanning stops at the first record whose length or checksum fails to
//! validate; the report records the truncation. The validated end becomes
//! the journal's append point.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::common::{Error, JournalAddress, Result, Timestamp};
use crate::journal::manager::{list_journal_files, JournalPositions};
use crate::journal::record::{self, Record, RecordPayload, RECORD_HEADER_SIZE};

/// Upper bound on a single record; guards the scanner against a corrupt
/// length field sending it off to allocate gigabytes.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// A committed logical update waiting for replay, with its tree resolved to
/// stable names (handles are only meaningful within one journal session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRef {
    pub addr: JournalAddress,
    pub start_ts: Timestamp,
    pub volume: String,
    pub tree: String,
}

/// Everything the root object needs to finish recovery.
#[derive(Debug, Default)]
pub struct RecoveryPlan {
    pub positions: JournalPositions,
    /// (volume name, page address) -> latest authoritative image record.
    pub page_map: HashMap<(String, u64), (JournalAddress, Timestamp)>,
    /// start_ts -> commit_ts of committed transactions.
    pub committed: HashMap<u64, u64>,
    /// Logical records of all transactions, in journal order; filter by
    /// `committed` before applying.
    pub logical: Vec<LogicalRef>,
    /// start_ts of transactions that began but never committed; their
    /// stray versions must stay invisible after recovery.
    pub uncommitted: Vec<u64>,
    /// Every (volume name, tree name) bound by an IT record; recovery
    /// recreates trees whose directory pages had not been captured yet.
    pub trees: Vec<(String, String)>,
    /// Highest timestamp observed anywhere in the journal.
    pub max_timestamp: Timestamp,
}

/// Progress counters exposed after recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed_transactions: usize,
    pub uncommitted_transactions: usize,
    pub applied_updates: usize,
    pub applied_pages: usize,
    pub errors: usize,
    pub keystone_address: JournalAddress,
    pub base_address: JournalAddress,
    pub end_address: JournalAddress,
    pub page_map_size: usize,
    pub transaction_map_size: usize,
    /// The failure that truncated replay early, if any.
    pub truncated_by: Option<String>,
}

pub struct RecoveryManager {
    files: Vec<(u64, PathBuf)>,
    pub plan: RecoveryPlan,
    pub report: RecoveryReport,
}

impl RecoveryManager {
    /// Scan the journal under `prefix` and build the recovery plan.
    pub fn scan(prefix: &Path) -> Result<Self> {
        let files = list_journal_files(prefix)?;
        let mut manager = Self {
            files,
            plan: RecoveryPlan::default(),
            report: RecoveryReport::default(),
        };
        manager.scan_files()?;
        Ok(manager)
    }

    fn scan_files(&mut self) -> Result<()> {
        // session-local bindings, rebuilt as IV/IT records stream past
        let mut volume_names: HashMap<u32, String> = HashMap::new();
        let mut tree_names: HashMap<u32, (String, String)> = HashMap::new();

        let mut tx_started: HashMap<u64, ()> = HashMap::new();
        let mut keystone = JournalAddress::ZERO;
        let mut keystone_ts = Timestamp::ZERO;
        let mut base = JournalAddress::ZERO;
        let mut end = JournalAddress::ZERO;
        let mut max_ts = Timestamp::ZERO;

        let files = self.files.clone();
        let mut expected_start = None::<u64>;
        'files: for (file_start, path) in &files {
            let file_start = *file_start;
            if let Some(expected) = expected_start {
                if file_start != expected {
                    self.report.truncated_by =
                        Some(format!("gap in journal files before {:?}", path));
                    self.report.errors += 1;
                    break;
                }
            }

            let mut file = File::open(path)?;
            let file_len = file.metadata()?.len();
            let mut offset = 0u64;

            while offset < file_len {
                let addr = JournalAddress::new(file_start + offset);
                match read_record(&mut file, offset, file_len, addr) {
                    Ok(None) => break, // clean end of this file
                    Err(e) => {
                        warn!("journal scan stopped at {}: {}", addr, e);
                        self.report.truncated_by = Some(e.to_string());
                        self.report.errors += 1;
                        end = addr;
                        break 'files;
                    }
                    Ok(Some((record, consumed))) => {
                        max_ts = max_ts.max(record.timestamp);
                        self.note_record(
                            addr,
                            &record,
                            &mut volume_names,
                            &mut tree_names,
                            &mut tx_started,
                            &mut keystone,
                            &mut keystone_ts,
                            &mut base,
                        );
                        offset += consumed as u64;
                        end = JournalAddress::new(file_start + offset);
                    }
                }
            }
            if self.report.truncated_by.is_some() {
                break;
            }
            expected_start = Some(file_start + offset);
        }

        // drop page-map entries below the base: their pages were already
        // copied back before the checkpoint was confirmed
        self.plan.page_map.retain(|_, (addr, _)| *addr >= base);

        // partition transactions
        let committed = self.plan.committed.len();
        self.plan.uncommitted = tx_started
            .keys()
            .filter(|ts| !self.plan.committed.contains_key(*ts))
            .copied()
            .collect();
        let uncommitted = self.plan.uncommitted.len();
        self.report.committed_transactions = committed;
        self.report.uncommitted_transactions = uncommitted;
        self.report.keystone_address = keystone;
        self.report.base_address = base;
        self.report.end_address = end;
        self.report.page_map_size = self.plan.page_map.len();
        self.report.transaction_map_size = tx_started.len();

        self.plan.positions = JournalPositions {
            current: end,
            base,
            keystone,
            keystone_ts,
        };
        self.plan.max_timestamp = max_ts;

        info!(
            "journal scan: {} committed, {} uncommitted, {} page images, end {}",
            committed,
            uncommitted,
            self.plan.page_map.len(),
            end
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn note_record(
        &mut self,
        addr: JournalAddress,
        record: &Record,
        volume_names: &mut HashMap<u32, String>,
        tree_names: &mut HashMap<u32, (String, String)>,
        tx_started: &mut HashMap<u64, ()>,
        keystone: &mut JournalAddress,
        keystone_ts: &mut Timestamp,
        base: &mut JournalAddress,
    ) {
        match &record.payload {
            RecordPayload::JournalHeader { .. } => {}
            RecordPayload::IdentifyVolume { volume, name, .. } => {
                volume_names.insert(volume.0, name.clone());
            }
            RecordPayload::IdentifyTree { tree, volume, name } => {
                let volume_name = volume_names
                    .get(&volume.0)
                    .cloned()
                    .unwrap_or_default();
                let binding = (volume_name, name.clone());
                if !self.plan.trees.contains(&binding) {
                    self.plan.trees.push(binding.clone());
                }
                tree_names.insert(tree.0, binding);
            }
            RecordPayload::PageImage { volume, page, .. } => {
                if let Some(volume_name) = volume_names.get(&volume.0) {
                    self.plan
                        .page_map
                        .insert((volume_name.clone(), page.0), (addr, record.timestamp));
                } else {
                    self.report.errors += 1;
                }
            }
            RecordPayload::TxStart => {
                tx_started.insert(record.timestamp.0, ());
            }
            RecordPayload::TxCommit { commit_ts } => {
                self.plan
                    .committed
                    .insert(record.timestamp.0, commit_ts.0);
            }
            RecordPayload::Store { tree, .. }
            | RecordPayload::DeleteRange { tree, .. }
            | RecordPayload::DeleteTree { tree } => {
                if let Some((volume, tree)) = tree_names.get(&tree.0) {
                    self.plan.logical.push(LogicalRef {
                        addr,
                        start_ts: record.timestamp,
                        volume: volume.clone(),
                        tree: tree.clone(),
                    });
                } else {
                    self.report.errors += 1;
                }
            }
            RecordPayload::Checkpoint { base_address, .. } => {
                *keystone = addr;
                *keystone_ts = record.timestamp;
                *base = *base_address;
            }
        }
    }

    /// Re-read one record by address (page images and logical replay pull
    /// their payloads lazily to keep the scan cheap).
    pub fn read_record_at(&self, addr: JournalAddress) -> Result<Record> {
        let (file_start, path) = self
            .files
            .iter()
            .rev()
            .find(|(start, _)| *start <= addr.0)
            .ok_or(Error::CorruptJournal(addr))?;

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let offset = addr.0 - file_start;
        match read_record(&mut file, offset, file_len, addr)? {
            Some((record, _)) => Ok(record),
            None => Err(Error::CorruptJournal(addr)),
        }
    }

    /// The logical records of committed transactions, in journal order.
    pub fn committed_logical(&self) -> impl Iterator<Item = &LogicalRef> {
        self.plan
            .logical
            .iter()
            .filter(|l| self.plan.committed.contains_key(&l.start_ts.0))
    }

    /// Commit timestamp of a committed transaction.
    pub fn commit_ts_of(&self, start_ts: Timestamp) -> Option<Timestamp> {
        self.plan.committed.get(&start_ts.0).map(|c| Timestamp::new(*c))
    }
}

/// Read and decode one record at `offset` of `file`. `Ok(None)` on a clean
/// end (zero fill or too few bytes for a header).
fn read_record(
    file: &mut File,
    offset: u64,
    file_len: u64,
    addr: JournalAddress,
) -> Result<Option<(Record, usize)>> {
    if file_len.saturating_sub(offset) < RECORD_HEADER_SIZE as u64 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset))?;

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    if length == 0 {
        return Ok(None);
    }
    if length < RECORD_HEADER_SIZE
        || length > MAX_RECORD_SIZE
        || offset + length as u64 > file_len
    {
        return Err(Error::CorruptJournal(addr));
    }

    let mut bytes = vec![0u8; length];
    bytes[..4].copy_from_slice(&len_bytes);
    file.read_exact(&mut bytes[4..])?;
    record::decode(&bytes, addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageAddress, TreeHandle, VolumeHandle};
    use crate::journal::manager::{JournalManager, JournalPositions as JP};
    use tempfile::tempdir;

    fn journal(dir: &Path) -> JournalManager {
        JournalManager::open(&dir.join("j"), 10_000_000, JP::default()).unwrap()
    }

    fn identify(j: &JournalManager) {
        j.append(
            Timestamp::ZERO,
            &RecordPayload::IdentifyVolume {
                volume: VolumeHandle::new(1),
                id: 7,
                created_at: 0,
                name: "data".into(),
            },
        )
        .unwrap();
        j.append(
            Timestamp::ZERO,
            &RecordPayload::IdentifyTree {
                tree: TreeHandle::new(1),
                volume: VolumeHandle::new(1),
                name: "t".into(),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_committed_vs_uncommitted() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path());
        identify(&j);

        // tx 10 commits, tx 20 does not
        j.append(Timestamp::new(10), &RecordPayload::TxStart).unwrap();
        j.append(
            Timestamp::new(10),
            &RecordPayload::Store {
                tree: TreeHandle::new(1),
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
        )
        .unwrap();
        j.append(
            Timestamp::new(10),
            &RecordPayload::TxCommit {
                commit_ts: Timestamp::new(11),
            },
        )
        .unwrap();

        j.append(Timestamp::new(20), &RecordPayload::TxStart).unwrap();
        j.append(
            Timestamp::new(20),
            &RecordPayload::Store {
                tree: TreeHandle::new(1),
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            },
        )
        .unwrap();
        j.force().unwrap();

        let recovery = RecoveryManager::scan(&dir.path().join("j")).unwrap();
        assert_eq!(recovery.report.committed_transactions, 1);
        assert_eq!(recovery.report.uncommitted_transactions, 1);

        let committed: Vec<_> = recovery.committed_logical().collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].start_ts, Timestamp::new(10));
        assert_eq!(committed[0].volume, "data");
        assert_eq!(committed[0].tree, "t");
        assert_eq!(recovery.commit_ts_of(Timestamp::new(10)), Some(Timestamp::new(11)));

        // the stored payload reads back by address
        let record = recovery.read_record_at(committed[0].addr).unwrap();
        match record.payload {
            RecordPayload::Store { key, value, .. } => {
                assert_eq!(key, b"a");
                assert_eq!(value, b"1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_latest_page_image_wins() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path());
        identify(&j);

        for ts in [5u64, 9, 7] {
            j.append(
                Timestamp::new(ts),
                &RecordPayload::PageImage {
                    volume: VolumeHandle::new(1),
                    page: PageAddress::new(3),
                    image: vec![ts as u8; 64],
                },
            )
            .unwrap();
        }
        j.force().unwrap();

        let recovery = RecoveryManager::scan(&dir.path().join("j")).unwrap();
        assert_eq!(recovery.plan.page_map.len(), 1);
        let (addr, ts) = recovery.plan.page_map[&("data".to_string(), 3)];
        // the last record in journal order is authoritative
        assert_eq!(ts, Timestamp::new(7));
        let record = recovery.read_record_at(addr).unwrap();
        match record.payload {
            RecordPayload::PageImage { image, .. } => assert_eq!(image, vec![7u8; 64]),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_truncates_at_corruption() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("j");
        let valid_end = {
            let j = journal(dir.path());
            identify(&j);
            j.append(Timestamp::new(10), &RecordPayload::TxStart).unwrap();
            j.force().unwrap();
            j.current_address()
        };

        // append garbage bytes behind the valid records
        {
            use std::io::Write;
            let files = list_journal_files(&prefix).unwrap();
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&files[0].1)
                .unwrap();
            f.write_all(&[0x99; 64]).unwrap();
        }

        let recovery = RecoveryManager::scan(&prefix).unwrap();
        assert!(recovery.report.truncated_by.is_some());
        assert_eq!(recovery.plan.positions.current, valid_end);
        assert_eq!(recovery.report.errors, 1);
    }

    #[test]
    fn test_checkpoint_sets_keystone_and_base() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path());
        identify(&j);

        j.append(Timestamp::new(10), &RecordPayload::TxStart).unwrap();
        j.append(
            Timestamp::new(10),
            &RecordPayload::TxCommit {
                commit_ts: Timestamp::new(11),
            },
        )
        .unwrap();
        let base = j.current_address();
        let cp_addr = j
            .append(
                Timestamp::new(12),
                &RecordPayload::Checkpoint {
                    base_address: base,
                    active: Vec::new(),
                },
            )
            .unwrap();
        j.force().unwrap();

        let recovery = RecoveryManager::scan(&dir.path().join("j")).unwrap();
        assert_eq!(recovery.plan.positions.keystone, cp_addr);
        assert_eq!(recovery.plan.positions.keystone_ts, Timestamp::new(12));
        assert_eq!(recovery.plan.positions.base, base);
    }

    #[test]
    fn test_empty_journal() {
        let dir = tempdir().unwrap();
        let recovery = RecoveryManager::scan(&dir.path().join("nothing")).unwrap();
        assert_eq!(recovery.plan.positions.current, JournalAddress::ZERO);
        assert_eq!(recovery.report.committed_transactions, 0);
    }
}
