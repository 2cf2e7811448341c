//! Entries enumerated out of a package, independent of the container format.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What an archive member claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Symlink,
    Hardlink,
}

/// One member of a package. `bytes` borrows from the buffer it was decoded
/// from and is never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    pub path: String,
    pub bytes: &'a [u8],
    pub kind: EntryKind,
    pub modified: Option<DateTime<Utc>>,
}

impl<'a> ArchiveEntry<'a> {
    /// A regular file entry with no timestamp.
    pub fn file(path: impl Into<String>, bytes: &'a [u8]) -> Self {
        Self {
            path: path.into(),
            bytes,
            kind: EntryKind::File,
            modified: None,
        }
    }

    /// Bytes charged against the budget. Link entries carry no payload.
    pub fn budget_len(&self) -> u64 {
        match self.kind {
            EntryKind::File => self.bytes.len() as u64,
            EntryKind::Symlink | EntryKind::Hardlink => 0,
        }
    }
}
