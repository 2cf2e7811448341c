//! Error taxonomy for package ingestion.
//!
//! Every failure that leaves the crate carries exactly one
//! [`PackageParseErrorCode`]. Callers match on the code, never on the message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageParseErrorCode {
    UnsupportedFormat,
    FormatSpoofed,
    PathTraversal,
    MaxEntriesExceeded,
    MaxUncompressedBytesExceeded,
    MaxSingleFileBytesExceeded,
    NestedArchiveDepthExceeded,
    SymlinkEntryRejected,
    HardlinkEntryRejected,
    AdapterParseFailed,
}

impl PackageParseErrorCode {
    /// Stable identifier, e.g. `FORMAT_SPOOFED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::FormatSpoofed => "FORMAT_SPOOFED",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::MaxEntriesExceeded => "MAX_ENTRIES_EXCEEDED",
            Self::MaxUncompressedBytesExceeded => "MAX_UNCOMPRESSED_BYTES_EXCEEDED",
            Self::MaxSingleFileBytesExceeded => "MAX_SINGLE_FILE_BYTES_EXCEEDED",
            Self::NestedArchiveDepthExceeded => "NESTED_ARCHIVE_DEPTH_EXCEEDED",
            Self::SymlinkEntryRejected => "SYMLINK_ENTRY_REJECTED",
            Self::HardlinkEntryRejected => "HARDLINK_ENTRY_REJECTED",
            Self::AdapterParseFailed => "ADAPTER_PARSE_FAILED",
        }
    }
}

impl fmt::Display for PackageParseErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged ingestion failure: one code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct PackageParseError {
    pub code: PackageParseErrorCode,
    pub message: String,
}

impl PackageParseError {
    pub fn new(code: PackageParseErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(PackageParseErrorCode::UnsupportedFormat, message)
    }

    pub fn format_spoofed(message: impl Into<String>) -> Self {
        Self::new(PackageParseErrorCode::FormatSpoofed, message)
    }

    pub fn path_traversal(path: &str) -> Self {
        Self::new(
            PackageParseErrorCode::PathTraversal,
            format!("unsafe archive path: {path:?}"),
        )
    }

    /// Wraps an untagged failure, keeping the offending path for diagnostics.
    pub fn adapter_parse_failed(path: &str, cause: impl fmt::Display) -> Self {
        Self::new(
            PackageParseErrorCode::AdapterParseFailed,
            format!("failed to parse {path:?}: {cause}"),
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PackageParseError>;
