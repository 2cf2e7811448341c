//! Per-entry header checks: archive-internal paths and link members.

use crate::entry::EntryKind;
use crate::error::{PackageParseError, PackageParseErrorCode, Result};

/// Fails with `PATH_TRAVERSAL` unless `path` is a relative path that stays
/// inside the extraction root. Backslashes count as separators.
pub fn assert_safe_path(path: &str) -> Result<()> {
    let normalized = path.replace('\\', "/");
    if is_unsafe(&normalized) {
        return Err(PackageParseError::path_traversal(path));
    }
    Ok(())
}

/// Path guard, then link rejection. Only regular files get past this, and
/// nothing about an entry is read or counted before it does.
pub fn assert_regular_entry(path: &str, kind: EntryKind) -> Result<()> {
    assert_safe_path(path)?;
    let code = match kind {
        EntryKind::File => return Ok(()),
        EntryKind::Symlink => PackageParseErrorCode::SymlinkEntryRejected,
        EntryKind::Hardlink => PackageParseErrorCode::HardlinkEntryRejected,
    };
    Err(PackageParseError::new(
        code,
        format!("{path:?} is a link; only regular files are accepted"),
    ))
}

fn is_unsafe(path: &str) -> bool {
    path.is_empty()
        || path.contains('\0')
        || path.starts_with('/')
        || path.starts_with("..")
        || path.contains("../")
        || path.ends_with("/..")
        || has_drive_prefix(path)
}

// "C:" style prefixes
fn has_drive_prefix(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_relative_paths() {
        for path in [
            "a.txt",
            "Takeout/Mail/All mail.mbox",
            "nested/dir/file.json",
            "./here.txt",
            "dots...in...name.txt",
            "folder/",
        ] {
            assert!(assert_safe_path(path).is_ok(), "{path} should be accepted");
        }
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        for path in [
            "",
            "../../../etc/passwd",
            "..",
            "subdir/../../outside.txt",
            "subdir/..",
            "/absolute/path/file.txt",
            "..\\..\\windows\\path.txt",
            "dir\\..\\..\\x",
            "\\\\server\\share",
            "C:\\Windows\\system.ini",
            "c:relative",
            "file\0hidden.txt",
        ] {
            let err = assert_safe_path(path).unwrap_err();
            assert_eq!(err.code, PackageParseErrorCode::PathTraversal, "{path:?}");
        }
    }

    #[test]
    fn path_is_checked_before_link_kind() {
        let code = |path, kind| assert_regular_entry(path, kind).unwrap_err().code;
        assert_eq!(code("../link", EntryKind::Symlink), PackageParseErrorCode::PathTraversal);
        assert_eq!(code("link", EntryKind::Symlink), PackageParseErrorCode::SymlinkEntryRejected);
        assert_eq!(code("copy", EntryKind::Hardlink), PackageParseErrorCode::HardlinkEntryRejected);
        assert!(assert_regular_entry("plain.txt", EntryKind::File).is_ok());
    }
}
