//! Multi-version value (MVV) encoding and pruning.
//!
//! A stored value is either *primordial* - the plain bytes, visible to every
//! transaction - or an MVV: a marker byte followed by versions tagged with
//! the start timestamp of the writing transaction.
//!
//! # Layout
//! ```text
//! primordial:  [bytes...]                      (first byte != 0xFE)
//! mvv:         [0xFE] entry* where
//! entry:       [writer_ts u64 | len u32 | bytes...]
//! ```
//! The high bit of `len` marks an *antivalue* - a deletion by that writer.
//! A primordial value whose own first byte would collide with the marker is
//! stored as an MVV with a single writer-0 entry; writer 0 means "committed
//! before every possible reader".
//!
//! Visibility and write-write conflict checks resolve each writer timestamp
//! through a [`Disposition`] closure supplied by the transaction index, so
//! this module stays free of locking concerns.

use crate::common::error::{Error, Result};
use crate::common::Timestamp;

/// First byte of an MVV-encoded value.
pub const MVV_MARKER: u8 = 0xFE;

const ENTRY_HEADER: usize = 12;
const ANTIVALUE_BIT: u32 = 0x8000_0000;

/// What the transaction index knows about a version's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Still running.
    Active,
    /// Rolled back; its versions are invisible to everyone.
    Aborted,
    /// Committed at the given timestamp. Writers evicted from the index
    /// report `Committed(Timestamp::ZERO)`: committed before any live
    /// reader began.
    Committed(Timestamp),
}

/// One decoded version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version<'a> {
    /// Start timestamp of the writer; 0 for the primordial version.
    pub writer: Timestamp,
    pub antivalue: bool,
    pub bytes: &'a [u8],
}

#[inline]
pub fn is_mvv(value: &[u8]) -> bool {
    value.first() == Some(&MVV_MARKER)
}

/// Decode a stored value into its versions. A primordial value decodes as a
/// single writer-0 version.
pub fn decode(value: &[u8]) -> Result<Vec<Version<'_>>> {
    if !is_mvv(value) {
        return Ok(vec![Version {
            writer: Timestamp::ZERO,
            antivalue: false,
            bytes: value,
        }]);
    }

    let mut versions = Vec::new();
    let mut pos = 1;
    while pos < value.len() {
        if pos + ENTRY_HEADER > value.len() {
            return Err(Error::Config("truncated multi-version value".into()));
        }
        let mut w = [0u8; 8];
        w.copy_from_slice(&value[pos..pos + 8]);
        let raw_len = u32::from_be_bytes([
            value[pos + 8],
            value[pos + 9],
            value[pos + 10],
            value[pos + 11],
        ]);
        let antivalue = raw_len & ANTIVALUE_BIT != 0;
        let len = (raw_len & !ANTIVALUE_BIT) as usize;
        let start = pos + ENTRY_HEADER;
        if start + len > value.len() {
            return Err(Error::Config("truncated multi-version value".into()));
        }
        versions.push(Version {
            writer: Timestamp::new(u64::from_be_bytes(w)),
            antivalue,
            bytes: &value[start..start + len],
        });
        pos = start + len;
    }
    Ok(versions)
}

fn encode(versions: &[Version<'_>]) -> Vec<u8> {
    // a lone committed non-antivalue version stores primordially when its
    // first byte cannot be mistaken for the marker
    if let [only] = versions {
        if only.writer == Timestamp::ZERO
            && !only.antivalue
            && only.bytes.first() != Some(&MVV_MARKER)
        {
            return only.bytes.to_vec();
        }
    }

    let total: usize = 1 + versions
        .iter()
        .map(|v| ENTRY_HEADER + v.bytes.len())
        .sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.push(MVV_MARKER);
    for v in versions {
        out.extend_from_slice(&v.writer.0.to_be_bytes());
        let mut len = v.bytes.len() as u32;
        if v.antivalue {
            len |= ANTIVALUE_BIT;
        }
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(v.bytes);
    }
    out
}

/// Encode a committed-for-everyone value: plain bytes, unless the first
/// byte would collide with the MVV marker, in which case a single
/// writer-0 entry wraps it.
pub fn encode_primordial(bytes: &[u8]) -> Vec<u8> {
    encode(&[Version {
        writer: Timestamp::ZERO,
        antivalue: false,
        bytes,
    }])
}

/// The version a reader with `start_ts` observes, or `None` when the key
/// does not exist for that reader (no visible version, or the visible
/// version is an antivalue).
pub fn visible<'a>(
    value: &'a [u8],
    reader: Timestamp,
    resolve: &dyn Fn(Timestamp) -> Disposition,
) -> Result<Option<&'a [u8]>> {
    let versions = decode(value)?;

    let mut best: Option<(Timestamp, &Version<'_>)> = None;
    for v in versions.iter() {
        if v.writer == reader {
            // own writes win outright; later entries supersede earlier ones
            best = Some((Timestamp::new(u64::MAX), v));
            continue;
        }
        if matches!(best, Some((ts, _)) if ts == Timestamp::new(u64::MAX)) {
            continue;
        }
        let commit_ts = match v.writer {
            Timestamp::ZERO => Timestamp::ZERO,
            w => match resolve(w) {
                Disposition::Committed(c) => c,
                Disposition::Active | Disposition::Aborted => continue,
            },
        };
        if commit_ts < reader && best.map_or(true, |(b, _)| commit_ts >= b) {
            best = Some((commit_ts, v));
        }
    }

    Ok(match best {
        Some((_, v)) if !v.antivalue => Some(v.bytes),
        _ => None,
    })
}

/// Add (or replace) `writer`'s version. Fails with [`Error::Rollback`] when
/// another transaction concurrent with `writer` has a version here: the
/// second writer loses, so exactly one of two concurrent writers to a key
/// can commit.
pub fn append_version(
    existing: Option<&[u8]>,
    writer: Timestamp,
    antivalue: bool,
    bytes: &[u8],
    resolve: &dyn Fn(Timestamp) -> Disposition,
) -> Result<Vec<u8>> {
    let mut versions: Vec<Version<'_>> = match existing {
        Some(value) => decode(value)?,
        None => Vec::new(),
    };

    for v in versions.iter() {
        if v.writer == writer || v.writer == Timestamp::ZERO {
            continue;
        }
        match resolve(v.writer) {
            // another active writer, or one that committed after this
            // writer began: write-write conflict
            Disposition::Active => return Err(Error::Rollback),
            Disposition::Committed(c) if c > writer => return Err(Error::Rollback),
            _ => {}
        }
    }

    // within one transaction the newest write supersedes the older one
    versions.retain(|v| v.writer != writer);
    versions.push(Version {
        writer,
        antivalue,
        bytes,
    });
    Ok(encode(&versions))
}

/// Outcome of pruning a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pruned {
    /// Nothing changed.
    Unchanged,
    /// Store these bytes in place of the old value.
    Rewritten(Vec<u8>),
    /// The value reduced to a primordial antivalue: remove the record.
    Remove,
}

/// Reduce an MVV toward its primordial form.
///
/// `floor` is the active-transaction floor: every active transaction has
/// `start_ts >= floor`, so a version committed below the floor is visible
/// to all of them. Versions by aborted writers are dropped; committed
/// versions older than a newer committed version below the floor are
/// unobservable and dropped; when a single committed-below-floor version
/// remains and no active writer holds a version, the value collapses to
/// primordial form.
pub fn prune(
    value: &[u8],
    floor: Timestamp,
    resolve: &dyn Fn(Timestamp) -> Disposition,
) -> Result<Pruned> {
    if !is_mvv(value) {
        return Ok(Pruned::Unchanged);
    }
    let versions = decode(value)?;

    // resolve every version once
    let mut kept: Vec<(Version<'_>, Option<Timestamp>)> = Vec::new(); // (version, commit_ts)
    for v in versions {
        let commit = match v.writer {
            Timestamp::ZERO => Some(Timestamp::ZERO),
            w => match resolve(w) {
                Disposition::Aborted => continue,
                Disposition::Active => None,
                Disposition::Committed(c) => Some(c),
            },
        };
        kept.push((v, commit));
    }

    // newest committed version below the floor
    let newest_settled = kept
        .iter()
        .filter_map(|(_, c)| *c)
        .filter(|c| *c < floor)
        .max();

    if let Some(settled) = newest_settled {
        // older committed versions are invisible to every reader
        kept.retain(|(_, c)| match c {
            Some(c) => *c >= settled,
            None => true,
        });
    }

    let has_active = kept.iter().any(|(_, c)| c.is_none());
    let all_settled_below_floor = kept
        .iter()
        .all(|(_, c)| matches!(c, Some(c) if *c < floor));

    if !has_active && all_settled_below_floor && kept.len() == 1 {
        let (v, _) = &kept[0];
        if v.antivalue {
            return Ok(Pruned::Remove);
        }
        return Ok(Pruned::Rewritten(encode(&[Version {
            writer: Timestamp::ZERO,
            antivalue: false,
            bytes: v.bytes,
        }])));
    }

    let rewritten = encode(
        &kept
            .iter()
            .map(|(v, c)| Version {
                // settle committed writers to primordial tags where legal
                writer: match c {
                    Some(c) if *c < floor => Timestamp::ZERO,
                    _ => v.writer,
                },
                antivalue: v.antivalue,
                bytes: v.bytes,
            })
            .collect::<Vec<_>>(),
    );
    if rewritten == value {
        Ok(Pruned::Unchanged)
    } else {
        Ok(Pruned::Rewritten(rewritten))
    }
}
