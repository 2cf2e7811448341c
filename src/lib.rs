//! Secure ingestion of untrusted export packages
//!
//! Accepts a single JSON document, a ZIP archive, a gzip-compressed TAR
//! archive or an ICS calendar, and enumerates its contents before anything
//! downstream parses them. Format spoofing, path traversal, link entries and
//! archive bombs (including archives nested inside archives) are rejected with
//! a [`PackageParseErrorCode`].
//!
//! # Usage
//!
//! ## Ingesting a package held in memory
//!
//! ```rust
//! use package_ingest::{parse_import_payload, ImportOptions, RawFilesSelector, PackageType};
//!
//! let parsed = parse_import_payload(
//!     "conversations.json",
//!     br#"[{"title": "hello"}]"#,
//!     &ImportOptions::default(),
//!     &RawFilesSelector,
//! ).unwrap();
//! assert_eq!(parsed.package_type, PackageType::Json);
//! assert_eq!(parsed.file_count, 1);
//! ```
//!
//! ## Tightening limits
//!
//! ```rust
//! use package_ingest::{parse_import_payload, ImportOptions, LimitOverrides, PackageParseErrorCode, RawFilesSelector};
//!
//! let options = ImportOptions {
//!     limits: LimitOverrides { max_single_file_bytes: Some(8), ..Default::default() },
//!     ..Default::default()
//! };
//! let err = parse_import_payload("notes.json", b"far more than eight bytes", &options, &RawFilesSelector)
//!     .unwrap_err();
//! assert_eq!(err.code, PackageParseErrorCode::MaxSingleFileBytesExceeded);
//! ```
//!
//! ## Ingesting off the calling thread
//!
//! ```rust
//! use std::sync::Arc;
//! use package_ingest::{dispatch_import, DispatchConfig, RawFilesSelector, WorkerRequest};
//!
//! let request = WorkerRequest::new("cal.ics", b"BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_vec());
//! let parsed = dispatch_import(request, Arc::new(RawFilesSelector), &DispatchConfig::default()).unwrap();
//! assert_eq!(parsed.records.len(), 1);
//! ```

pub mod adapter;
pub mod decompress;
pub mod entry;
pub mod error;
pub mod ingest;
pub mod limits;
pub mod nested;
pub mod path_guard;
pub mod sniff;
pub mod tar;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

pub use adapter::{Adapter, AdapterError, AdapterSelector, DecodedFile, RawFilesAdapter, RawFilesSelector};
pub use entry::{ArchiveEntry, EntryKind};
pub use error::{PackageParseError, PackageParseErrorCode, Result};
pub use ingest::{ImportOptions, ParsedImportPackage, parse_import_payload, parse_import_payload_cancellable};
pub use limits::{LimitOverrides, PackageSecurityLimits, SecurityBudgetLedger};
pub use nested::enforce_limits;
pub use path_guard::{assert_regular_entry, assert_safe_path};
pub use sniff::{PackageType, detect_package_type};
pub use tar::read_tar;
pub use worker::{DispatchConfig, DispatchError, WorkerRequest, WorkerResponse, dispatch_import};

// ----------------------------------------------------------------
// file-based helpers
// ----------------------------------------------------------------

/// One top-level entry of a package, as reported by [`list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub path: String,
    pub size: u64,
    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
}

/// Reads a package from disk. The upload name is the file's base name.
pub fn read_package(path: &Path) -> Result<(String, Vec<u8>)> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bytes = fs::read(path).map_err(|e| PackageParseError::adapter_parse_failed(&path.display().to_string(), e))?;
    Ok((file_name, bytes))
}

/// Ingests a package file with the given options and adapter selector
pub fn inspect_file(path: &Path, options: &ImportOptions, selector: &dyn AdapterSelector) -> Result<ParsedImportPackage> {
    let (file_name, bytes) = read_package(path)?;
    parse_import_payload(&file_name, &bytes, options, selector)
}

/// Lists the top-level entries of a package file after every limit has been enforced
pub fn list(path: &Path, limits: &PackageSecurityLimits) -> Result<(PackageType, Vec<EntrySummary>)> {
    let (file_name, bytes) = read_package(path)?;
    let cancel = AtomicBool::new(false);
    ingest::with_checked_entries(&file_name, &bytes, limits, &cancel, |package_type, entries, _ledger| {
        let summaries: Vec<EntrySummary> = entries
            .iter()
            .map(|entry| EntrySummary {
                path: entry.path.clone(),
                size: entry.budget_len(),
                kind: entry.kind,
                modified: entry.modified,
            })
            .collect();
        Ok((package_type, summaries))
    })
}
