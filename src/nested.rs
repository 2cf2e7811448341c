//! Budget enforcement over entries, recursing into archives found inside archives.
//!
//! Nested archives are opened only to account for what they expand into; their
//! members are never handed downstream. Every level charges the same ledger, so
//! nesting buys an attacker no extra budget.

use crate::decompress::{InflateCap, InflateError, InflatedFile, gunzip, unzip};
use crate::entry::ArchiveEntry;
use crate::error::{PackageParseError, PackageParseErrorCode, Result};
use crate::limits::{
    PackageSecurityLimits, SecurityBudgetLedger, entries_exceeded, single_file_exceeded, total_bytes_exceeded,
};
use crate::path_guard::assert_regular_entry;
use crate::sniff::{PackageType, has_gzip_magic, has_zip_magic, type_from_extension};
use crate::tar::{TarHeader, looks_like_tar, read_tar, scan_headers};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Depth of the entries handed to [`enforce_limits`].
pub const TOP_LEVEL_DEPTH: u32 = 1;

/// Checks every entry (and everything nested inside them) against `limits`,
/// returning the final ledger.
pub fn enforce_limits(
    entries: &[ArchiveEntry<'_>],
    limits: &PackageSecurityLimits,
) -> Result<SecurityBudgetLedger> {
    let mut ledger = SecurityBudgetLedger::new();
    enforce_entries(entries, limits, &mut ledger, TOP_LEVEL_DEPTH, &AtomicBool::new(false))?;
    Ok(ledger)
}

/// Applies path, link and budget checks to `entries` at `depth`, charging
/// `ledger`. Stops between entries once `cancel` is raised.
pub fn enforce_entries(
    entries: &[ArchiveEntry<'_>],
    limits: &PackageSecurityLimits,
    ledger: &mut SecurityBudgetLedger,
    depth: u32,
    cancel: &AtomicBool,
) -> Result<()> {
    for entry in entries {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled());
        }
        assert_regular_entry(&entry.path, entry.kind)?;
        ledger.consume(&entry.path, entry.budget_len(), limits)?;
        inspect_nested(entry, limits, ledger, depth, cancel)?;
    }
    Ok(())
}

/// The archive format an entry claims to hold: by extension first, then by
/// magic bytes. Whether the content agrees is settled by decompressing it.
pub fn nested_archive_type(path: &str, bytes: &[u8]) -> Option<PackageType> {
    match type_from_extension(path) {
        Some(kind) if kind.is_archive() => Some(kind),
        _ if has_zip_magic(bytes) => Some(PackageType::Zip),
        _ if has_gzip_magic(bytes) => Some(PackageType::Tgz),
        _ => None,
    }
}

fn inspect_nested(
    entry: &ArchiveEntry<'_>,
    limits: &PackageSecurityLimits,
    ledger: &mut SecurityBudgetLedger,
    depth: u32,
    cancel: &AtomicBool,
) -> Result<()> {
    let Some(kind) = nested_archive_type(&entry.path, entry.bytes) else {
        return Ok(());
    };

    // checked before decompressing anything
    let next_depth = depth.saturating_add(1);
    if next_depth > limits.max_nested_archive_depth {
        return Err(PackageParseError::new(
            PackageParseErrorCode::NestedArchiveDepthExceeded,
            format!(
                "{:?} nests archives deeper than {} levels",
                entry.path, limits.max_nested_archive_depth
            ),
        ));
    }

    debug!(path = %entry.path, %kind, depth = next_depth, "inspecting nested archive");
    let cap = InflateCap::from_budget(limits, ledger);
    match kind {
        PackageType::Zip => {
            let files = unzip(entry.bytes, cap, cancel)
                .map_err(|e| inflate_failure(e, &entry.path, limits, *ledger))?;
            let children: Vec<_> = files.iter().map(InflatedFile::as_entry).collect();
            enforce_entries(&children, limits, ledger, next_depth, cancel)
        }
        PackageType::Tgz => {
            let data = gunzip(entry.bytes, cap.tar_stream_bytes(), cancel)
                .map_err(|e| inflate_failure(e, &entry.path, limits, *ledger))?;
            let children = gzip_members(&entry.path, &data)?;
            enforce_entries(&children, limits, ledger, next_depth, cancel)
        }
        PackageType::Json | PackageType::Ics => Ok(()),
    }
}

/// Entries inside an inflated gzip stream: the TAR members when the stream is
/// a TAR, otherwise the stream itself as a single file.
pub fn gzip_members<'a>(container: &str, data: &'a [u8]) -> Result<Vec<ArchiveEntry<'a>>> {
    if looks_like_tar(data) {
        return read_tar(data).map_err(|e| PackageParseError::adapter_parse_failed(container, e));
    }
    Ok(vec![ArchiveEntry::file(strip_gzip_suffix(container), data)])
}

fn strip_gzip_suffix(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tgz") {
        format!("{}.tar", &name[..name.len() - 4])
    } else if lower.ends_with(".gz") && name.len() > 3 {
        name[..name.len() - 3].to_string()
    } else {
        name.to_string()
    }
}

pub(crate) fn cancelled() -> PackageParseError {
    PackageParseError::new(PackageParseErrorCode::AdapterParseFailed, "ingestion was cancelled")
}

/// Maps a decompression failure of `container` onto the error taxonomy.
/// `ledger` is the budget as it stood before `container` was opened.
pub(crate) fn inflate_failure(
    err: InflateError,
    container: &str,
    limits: &PackageSecurityLimits,
    ledger: SecurityBudgetLedger,
) -> PackageParseError {
    match err {
        InflateError::Rejected(err) => err,
        InflateError::TooManyEntries { .. } => entries_exceeded(limits),
        InflateError::EntryTooLarge { path, .. } => single_file_exceeded(&path, limits),
        InflateError::TotalTooLarge { .. } => total_bytes_exceeded(limits),
        InflateError::StreamTooLarge { inflated, .. } => stream_overflow(container, &inflated, limits, ledger),
        other => PackageParseError::adapter_parse_failed(container, other),
    }
}

// The stream was cut off at its cap. Every entry whose header made it into the
// prefix still gets the per-entry checks, in order, before the total is blamed.
fn stream_overflow(
    container: &str,
    inflated: &[u8],
    limits: &PackageSecurityLimits,
    mut ledger: SecurityBudgetLedger,
) -> PackageParseError {
    let verdict = if looks_like_tar(inflated) {
        scan_headers(inflated).iter().try_for_each(|header: &TarHeader| {
            let path = header.full_path();
            assert_regular_entry(&path, header.kind())?;
            ledger.consume(&path, header.size, limits)
        })
    } else {
        ledger.consume(&strip_gzip_suffix(container), inflated.len() as u64, limits)
    };
    verdict.err().unwrap_or_else(|| total_bytes_exceeded(limits))
}
