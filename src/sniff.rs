//! Package type detection with extension/content cross-checks.

use crate::error::{PackageParseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How many leading bytes the binary heuristic looks at.
const SNIFF_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Json,
    Zip,
    Tgz,
    Ics,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Zip => "zip",
            Self::Tgz => "tgz",
            Self::Ics => "ics",
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Zip | Self::Tgz)
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `PK` followed by a local-header, empty-archive or spanned marker.
pub fn has_zip_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == b'P' && bytes[1] == b'K' && matches!(bytes[2], 0x03 | 0x05 | 0x07)
}

pub fn has_gzip_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

/// Package type implied by the file name alone.
pub fn type_from_extension(file_name: &str) -> Option<PackageType> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        Some(PackageType::Zip)
    } else if lower.ends_with(".tgz") || lower.ends_with(".tar.gz") || lower.ends_with(".gz") {
        Some(PackageType::Tgz)
    } else if lower.ends_with(".ics") {
        Some(PackageType::Ics)
    } else if lower.ends_with(".json") {
        Some(PackageType::Json)
    } else {
        None
    }
}

/// Classifies `bytes` uploaded as `file_name`.
///
/// A recognized extension must agree with the content: archive extensions
/// need the matching magic, and text extensions must not carry archive magic
/// (`FORMAT_SPOOFED`). Without a recognized extension the content decides,
/// and binary-looking content with no archive magic is `UNSUPPORTED_FORMAT`.
pub fn detect_package_type(file_name: &str, bytes: &[u8]) -> Result<PackageType> {
    let is_zip = has_zip_magic(bytes);
    let is_gzip = has_gzip_magic(bytes);

    match type_from_extension(file_name) {
        Some(PackageType::Zip) if !is_zip => Err(PackageParseError::format_spoofed(format!(
            "{file_name:?} is named as a ZIP archive but lacks the ZIP signature"
        ))),
        Some(PackageType::Tgz) if !is_gzip => Err(PackageParseError::format_spoofed(format!(
            "{file_name:?} is named as a gzip archive but lacks the gzip signature"
        ))),
        Some(kind @ (PackageType::Json | PackageType::Ics)) if is_zip || is_gzip => {
            Err(PackageParseError::format_spoofed(format!(
                "{file_name:?} is named as {kind} but contains an archive"
            )))
        }
        Some(kind) => Ok(kind),
        None if is_zip => Ok(PackageType::Zip),
        None if is_gzip => Ok(PackageType::Tgz),
        None if looks_like_text(bytes) => Ok(PackageType::Json),
        None => Err(PackageParseError::unsupported_format(format!(
            "{file_name:?} is not a recognized export package"
        ))),
    }
}

fn looks_like_text(bytes: &[u8]) -> bool {
    !bytes.iter().take(SNIFF_WINDOW).any(|&b| b == 0)
}
