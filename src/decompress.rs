//! Bounded wrappers over the `zip` and `flate2` decoders.
//!
//! Neither decoder is trusted to stop on its own: every read is capped by the
//! budget that remains, so a bomb fails here instead of exhausting memory.

use crate::entry::{ArchiveEntry, EntryKind};
use crate::error::PackageParseError;
use crate::limits::{PackageSecurityLimits, SecurityBudgetLedger};
use crate::path_guard::assert_regular_entry;
use crate::tar::BLOCK_SIZE;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use flate2::read::GzDecoder;
use std::fmt;
use std::io::{Cursor, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

// one default tar record, for writers that pad the end of the stream
const TAR_RECORD_SLACK: u64 = 20 * BLOCK_SIZE as u64;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Error)]
pub enum InflateError {
    /// A member failed the path guard or is a link. Nothing of it was read.
    #[error(transparent)]
    Rejected(#[from] PackageParseError),
    #[error("archive holds more than {limit} members")]
    TooManyEntries { limit: usize },
    #[error("entry {path:?} inflates past {limit} bytes")]
    EntryTooLarge { path: String, limit: u64 },
    #[error("archive inflates past {limit} bytes")]
    TotalTooLarge { limit: u64 },
    /// A gzip stream hit its cap; `inflated` holds the first `limit + 1` bytes.
    #[error("gzip stream inflates past {limit} bytes")]
    StreamTooLarge { limit: u64, inflated: Vec<u8> },
    #[error("ingestion was cancelled")]
    Cancelled,
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("decompression failed: {0}")]
    Io(#[from] std::io::Error),
}

// the inflated prefix can be hundreds of megabytes
impl fmt::Debug for InflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(err) => f.debug_tuple("Rejected").field(err).finish(),
            Self::TooManyEntries { limit } => f.debug_struct("TooManyEntries").field("limit", limit).finish(),
            Self::EntryTooLarge { path, limit } => f
                .debug_struct("EntryTooLarge")
                .field("path", path)
                .field("limit", limit)
                .finish(),
            Self::TotalTooLarge { limit } => f.debug_struct("TotalTooLarge").field("limit", limit).finish(),
            Self::StreamTooLarge { limit, inflated } => f
                .debug_struct("StreamTooLarge")
                .field("limit", limit)
                .field("inflated_len", &inflated.len())
                .finish(),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Zip(err) => f.debug_tuple("Zip").field(err).finish(),
            Self::Io(err) => f.debug_tuple("Io").field(err).finish(),
        }
    }
}

/// How much a single decompression call may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflateCap {
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    pub max_entries: usize,
}

impl InflateCap {
    /// Whatever the ledger has not spent yet.
    pub fn from_budget(limits: &PackageSecurityLimits, ledger: &SecurityBudgetLedger) -> Self {
        Self {
            max_entry_bytes: limits.max_single_file_bytes,
            max_total_bytes: ledger.remaining_bytes(limits),
            max_entries: ledger.remaining_entries(limits),
        }
    }

    /// Ceiling for a decompressed TAR stream: the payload budget plus a header
    /// and worst-case padding per permitted entry, and the trailer.
    pub fn tar_stream_bytes(&self) -> u64 {
        let overhead = (self.max_entries as u64)
            .saturating_add(2)
            .saturating_mul(2 * BLOCK_SIZE as u64)
            .saturating_add(TAR_RECORD_SLACK);
        self.max_total_bytes.saturating_add(overhead)
    }
}

/// A ZIP member pulled into memory. Only regular files make it this far.
#[derive(Debug, Clone)]
pub struct InflatedFile {
    pub path: String,
    pub data: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
}

impl InflatedFile {
    pub fn as_entry(&self) -> ArchiveEntry<'_> {
        ArchiveEntry {
            path: self.path.clone(),
            bytes: &self.data,
            kind: EntryKind::File,
            modified: self.modified,
        }
    }
}

/// Enumerates every ZIP member in central-directory order. Directories come
/// back as empty file entries.
///
/// Members are checked in the ledger's order: path guard, link rejection
/// (Unix mode `0o120000`), member count, then size. The first two happen
/// before a single byte of the member is inflated.
pub fn unzip(bytes: &[u8], cap: InflateCap, cancel: &AtomicBool) -> Result<Vec<InflatedFile>, InflateError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut files = Vec::with_capacity(archive.len().min(cap.max_entries));
    let mut total: u64 = 0;

    for index in 0..archive.len() {
        if cancel.load(Ordering::Relaxed) {
            return Err(InflateError::Cancelled);
        }
        let mut file = archive.by_index(index)?;
        let path = file.name().to_string();
        let kind = match file.unix_mode() {
            Some(mode) if mode & S_IFMT == S_IFLNK => EntryKind::Symlink,
            _ => EntryKind::File,
        };
        assert_regular_entry(&path, kind)?;
        if index >= cap.max_entries {
            return Err(InflateError::TooManyEntries {
                limit: cap.max_entries,
            });
        }
        let modified = zip_datetime_to_chrono(file.last_modified());

        let remaining = cap.max_total_bytes.saturating_sub(total);
        let limit = cap.max_entry_bytes.min(remaining);
        let hint = file.size().min(limit);
        let data = read_bounded(&mut file, limit, usize::try_from(hint).unwrap_or(0), cancel)?;
        let len = data.len() as u64;
        if len > limit {
            if len > cap.max_entry_bytes {
                return Err(InflateError::EntryTooLarge {
                    path,
                    limit: cap.max_entry_bytes,
                });
            }
            return Err(InflateError::TotalTooLarge {
                limit: cap.max_total_bytes,
            });
        }
        total += len;

        files.push(InflatedFile { path, data, modified });
    }
    Ok(files)
}

/// Inflates a gzip stream, failing once it produces more than `limit` bytes.
/// The overflow error keeps what was inflated so its headers can still be vetted.
pub fn gunzip(bytes: &[u8], limit: u64, cancel: &AtomicBool) -> Result<Vec<u8>, InflateError> {
    let mut decoder = GzDecoder::new(bytes);
    let data = read_bounded(&mut decoder, limit, 0, cancel)?;
    if data.len() as u64 > limit {
        return Err(InflateError::StreamTooLarge { limit, inflated: data });
    }
    Ok(data)
}

// reads at most `limit + 1` bytes so the caller can tell "exactly at the cap" from "over it"
fn read_bounded<R: Read>(
    reader: &mut R,
    limit: u64,
    capacity: usize,
    cancel: &AtomicBool,
) -> Result<Vec<u8>, InflateError> {
    let mut data = Vec::with_capacity(capacity);
    let mut reader = reader.take(limit.saturating_add(1));
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(InflateError::Cancelled);
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(data)
}

fn zip_datetime_to_chrono(value: zip::DateTime) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(value.year().into(), value.month().into(), value.day().into())?;
    let time = NaiveTime::from_hms_opt(value.hour().into(), value.minute().into(), value.second().into())?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(
        NaiveDateTime::new(date, time),
        Utc,
    ))
}
