//! Resource ceilings and the running ledger that enforces them.

use crate::error::{PackageParseError, PackageParseErrorCode, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Ceilings applied to one ingestion run, nested archives included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSecurityLimits {
    /// Total decompressed bytes across every entry. Default: 500 MiB.
    pub max_uncompressed_bytes: u64,
    /// Total entries across every archive level. Default: 20,000.
    pub max_archive_entries: usize,
    /// How many archive levels may be opened. Default: 3.
    pub max_nested_archive_depth: u32,
    /// Size of any one entry. Default: 50 MiB.
    pub max_single_file_bytes: u64,
}

impl Default for PackageSecurityLimits {
    fn default() -> Self {
        Self {
            max_uncompressed_bytes: 500 * MIB,
            max_archive_entries: 20_000,
            max_nested_archive_depth: 3,
            max_single_file_bytes: 50 * MIB,
        }
    }
}

/// Caller-supplied partial limits. Unset fields keep their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    pub max_uncompressed_bytes: Option<u64>,
    pub max_archive_entries: Option<usize>,
    pub max_nested_archive_depth: Option<u32>,
    pub max_single_file_bytes: Option<u64>,
}

impl LimitOverrides {
    /// Merges these overrides over [`PackageSecurityLimits::default`].
    pub fn resolve(&self) -> PackageSecurityLimits {
        let defaults = PackageSecurityLimits::default();
        PackageSecurityLimits {
            max_uncompressed_bytes: self.max_uncompressed_bytes.unwrap_or(defaults.max_uncompressed_bytes),
            max_archive_entries: self.max_archive_entries.unwrap_or(defaults.max_archive_entries),
            max_nested_archive_depth: self
                .max_nested_archive_depth
                .unwrap_or(defaults.max_nested_archive_depth),
            max_single_file_bytes: self.max_single_file_bytes.unwrap_or(defaults.max_single_file_bytes),
        }
    }
}

impl From<PackageSecurityLimits> for LimitOverrides {
    fn from(limits: PackageSecurityLimits) -> Self {
        Self {
            max_uncompressed_bytes: Some(limits.max_uncompressed_bytes),
            max_archive_entries: Some(limits.max_archive_entries),
            max_nested_archive_depth: Some(limits.max_nested_archive_depth),
            max_single_file_bytes: Some(limits.max_single_file_bytes),
        }
    }
}

/// Running totals for one ingestion run. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecurityBudgetLedger {
    pub file_count: usize,
    pub total_uncompressed_bytes: u64,
}

impl SecurityBudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charges one entry of `len` bytes against `limits`.
    pub fn consume(&mut self, path: &str, len: u64, limits: &PackageSecurityLimits) -> Result<()> {
        self.file_count = self.file_count.saturating_add(1);
        if self.file_count > limits.max_archive_entries {
            return Err(entries_exceeded(limits));
        }

        if len > limits.max_single_file_bytes {
            return Err(single_file_exceeded(path, limits));
        }

        self.total_uncompressed_bytes = self.total_uncompressed_bytes.saturating_add(len);
        if self.total_uncompressed_bytes > limits.max_uncompressed_bytes {
            return Err(total_bytes_exceeded(limits));
        }
        Ok(())
    }

    /// Bytes still available under the total ceiling.
    pub fn remaining_bytes(&self, limits: &PackageSecurityLimits) -> u64 {
        limits.max_uncompressed_bytes.saturating_sub(self.total_uncompressed_bytes)
    }

    /// Entries still available under the entry ceiling.
    pub fn remaining_entries(&self, limits: &PackageSecurityLimits) -> usize {
        limits.max_archive_entries.saturating_sub(self.file_count)
    }
}

pub(crate) fn entries_exceeded(limits: &PackageSecurityLimits) -> PackageParseError {
    PackageParseError::new(
        PackageParseErrorCode::MaxEntriesExceeded,
        format!("package holds more than {} entries", limits.max_archive_entries),
    )
}

pub(crate) fn single_file_exceeded(path: &str, limits: &PackageSecurityLimits) -> PackageParseError {
    PackageParseError::new(
        PackageParseErrorCode::MaxSingleFileBytesExceeded,
        format!("{path:?} is larger than {} bytes", limits.max_single_file_bytes),
    )
}

pub(crate) fn total_bytes_exceeded(limits: &PackageSecurityLimits) -> PackageParseError {
    PackageParseError::new(
        PackageParseErrorCode::MaxUncompressedBytesExceeded,
        format!("package expands past {} bytes", limits.max_uncompressed_bytes),
    )
}
