//! Top-level ingestion: sniff, extract, enforce limits, decode, hand off.

use crate::adapter::{AdapterSelector, DecodedFile};
use crate::decompress::{InflateCap, InflatedFile, gunzip, unzip};
use crate::entry::{ArchiveEntry, EntryKind};
use crate::error::{PackageParseError, Result};
use crate::limits::{LimitOverrides, PackageSecurityLimits, SecurityBudgetLedger};
use crate::nested::{TOP_LEVEL_DEPTH, enforce_entries, gzip_members, inflate_failure};
use crate::sniff::{PackageType, detect_package_type};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::atomic::AtomicBool;
use tracing::{debug, info, warn};

/// Caller configuration for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Hint for the adapter selector, e.g. `"gmail"`.
    pub selected_source: Option<String>,
    pub limits: LimitOverrides,
}

/// What a successful run hands back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedImportPackage {
    pub source_type: String,
    pub package_type: PackageType,
    pub records: Vec<Value>,
    pub file_count: usize,
    pub total_uncompressed_bytes: u64,
    pub warnings: Vec<String>,
}

/// Ingests `bytes` uploaded as `file_name`.
///
/// Every entry (nested archives included) passes the path, link and budget
/// checks before any text is decoded. Top-level files are then decoded as
/// lossy UTF-8 and normalized by the adapter `selector` picks.
pub fn parse_import_payload(
    file_name: &str,
    bytes: &[u8],
    options: &ImportOptions,
    selector: &dyn AdapterSelector,
) -> Result<ParsedImportPackage> {
    parse_import_payload_cancellable(file_name, bytes, options, selector, &AtomicBool::new(false))
}

/// [`parse_import_payload`] that gives up with `ADAPTER_PARSE_FAILED` once
/// `cancel` is raised. Checked between entries and between decompressed chunks.
pub fn parse_import_payload_cancellable(
    file_name: &str,
    bytes: &[u8],
    options: &ImportOptions,
    selector: &dyn AdapterSelector,
    cancel: &AtomicBool,
) -> Result<ParsedImportPackage> {
    let limits = options.limits.resolve();
    let result = with_checked_entries(file_name, bytes, &limits, cancel, |package_type, entries, ledger| {
        let mut warnings = Vec::new();
        let files: Vec<DecodedFile> = entries
            .iter()
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| decode_entry(entry, &mut warnings))
            .collect();

        let adapter = selector
            .select(&files, options.selected_source.as_deref())
            .map_err(|e| PackageParseError::adapter_parse_failed(file_name, e))?;
        let records = adapter
            .normalize(&files)
            .map_err(|e| PackageParseError::adapter_parse_failed(file_name, e))?;

        Ok(ParsedImportPackage {
            source_type: adapter.source_type().to_string(),
            package_type,
            records,
            file_count: ledger.file_count,
            total_uncompressed_bytes: ledger.total_uncompressed_bytes,
            warnings,
        })
    });

    match &result {
        Ok(parsed) => info!(
            file_name,
            package_type = %parsed.package_type,
            source_type = %parsed.source_type,
            file_count = parsed.file_count,
            total_bytes = parsed.total_uncompressed_bytes,
            "package accepted"
        ),
        Err(err) => warn!(file_name, code = %err.code, "package rejected: {}", err.message),
    }
    result
}

/// Sniffs and extracts the top-level entries of a package, runs
/// [`enforce_limits`](crate::nested::enforce_limits) over them, and passes
/// the survivors to `f`.
///
/// Entries borrow from buffers owned by this call, hence the callback.
pub fn with_checked_entries<T, F>(
    file_name: &str,
    bytes: &[u8],
    limits: &PackageSecurityLimits,
    cancel: &AtomicBool,
    f: F,
) -> Result<T>
where
    F: FnOnce(PackageType, &[ArchiveEntry<'_>], SecurityBudgetLedger) -> Result<T>,
{
    let package_type = detect_package_type(file_name, bytes)?;
    debug!(file_name, %package_type, size = bytes.len(), "detected package type");

    let mut ledger = SecurityBudgetLedger::new();
    let cap = InflateCap::from_budget(limits, &ledger);
    let zip_files: Vec<InflatedFile>;
    let tar_data: Vec<u8>;
    let entries: Vec<ArchiveEntry<'_>> = match package_type {
        PackageType::Zip => {
            zip_files = unzip(bytes, cap, cancel).map_err(|e| inflate_failure(e, file_name, limits, ledger))?;
            zip_files.iter().map(InflatedFile::as_entry).collect()
        }
        PackageType::Tgz => {
            tar_data = gunzip(bytes, cap.tar_stream_bytes(), cancel)
                .map_err(|e| inflate_failure(e, file_name, limits, ledger))?;
            gzip_members(file_name, &tar_data)?
        }
        PackageType::Json | PackageType::Ics => vec![ArchiveEntry::file(file_name, bytes)],
    };
    debug!(file_name, entries = entries.len(), "extracted top-level entries");

    enforce_entries(&entries, limits, &mut ledger, TOP_LEVEL_DEPTH, cancel)?;
    f(package_type, &entries, ledger)
}

fn decode_entry(entry: &ArchiveEntry<'_>, warnings: &mut Vec<String>) -> DecodedFile {
    let bytes = entry.bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(entry.bytes);
    let text = match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(text) => text.to_string(),
        Cow::Owned(text) => {
            warnings.push(format!("{}: invalid UTF-8 sequences were replaced", entry.path));
            text
        }
    };
    DecodedFile {
        path: entry.path.clone(),
        text,
    }
}
