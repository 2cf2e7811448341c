//! Hand-rolled TAR block decoder
//!
//! # Usage
//!
//! ## Reading TAR archives
//!
//! ```rust
//! use package_ingest::tar::{read_tar, TarBuilder};
//!
//! let mut tar = TarBuilder::new();
//! tar.add_file("a.txt", b"hi");
//! let tar_data = tar.to_bytes();
//!
//! // Entries borrow their payload from `tar_data`
//! let entries = read_tar(&tar_data).unwrap();
//! assert_eq!(entries[0].path, "a.txt");
//! assert_eq!(entries[0].bytes, b"hi");
//! ```
//!
//! ## Working with headers
//!
//! ```rust
//! use package_ingest::tar::TarHeader;
//!
//! let header = TarHeader::new("file.txt".to_string(), 0o644, 1024);
//! let bytes = header.to_bytes();
//! let parsed = TarHeader::from_bytes(&bytes);
//! assert_eq!(parsed.size, 1024);
//! assert!(parsed.verify_checksum(&bytes));
//! ```

use crate::entry::{ArchiveEntry, EntryKind};
use chrono::{DateTime, Utc};
use std::ops::Range;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CHECKSUM: Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const LINKNAME: Range<usize> = 157..257;
const MAGIC: Range<usize> = 257..263;
const VERSION: Range<usize> = 263..265;
const PREFIX: Range<usize> = 345..500;

pub const TYPE_FILE: u8 = b'0';
pub const TYPE_HARDLINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TarError {
    #[error("entry {path:?} at offset {offset} declares {size} bytes but only {available} remain")]
    Truncated {
        path: String,
        offset: usize,
        size: u64,
        available: usize,
    },
}

// Tar header struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u32,
    pub typeflag: u8,
    pub linkname: String,
    pub magic: String,
    pub version: String,
    pub prefix: String,
}

impl TarHeader {
    /// Create a new regular-file header; other fields get default values
    pub fn new(name: String, mode: u32, size: u64) -> Self {
        Self {
            name,
            mode,
            size,
            mtime: 0,
            checksum: 0,
            typeflag: TYPE_FILE,
            linkname: String::new(),
            magic: "ustar".to_string(),
            version: "00".to_string(),
            prefix: String::new(),
        }
    }

    /// Parse a TarHeader from a 512-byte block
    pub fn from_bytes(data: &[u8]) -> Self {
        parse_tar_header(data)
    }

    /// Convert the TarHeader to a 512-byte block, checksum included
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        create_tar_header(self)
    }

    /// Returns true if `data` sums to the stored checksum
    pub fn verify_checksum(&self, data: &[u8]) -> bool {
        calc_checksum(data) == self.checksum
    }

    /// `prefix/name` when the USTAR prefix is present, else `name`
    pub fn full_path(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.prefix, self.name)
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.typeflag {
            TYPE_SYMLINK => EntryKind::Symlink,
            TYPE_HARDLINK => EntryKind::Hardlink,
            _ => EntryKind::File,
        }
    }

    /// Modification time; an unset (zero) mtime yields `None`
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        if self.mtime == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::try_from(self.mtime).ok()?, 0)
    }
}

/// Decodes a TAR byte buffer into entries that borrow their payload from `data`.
///
/// Stops at the first all-zero block. A payload running past the end of the
/// buffer fails the whole archive rather than yielding a partial entry.
pub fn read_tar(data: &[u8]) -> Result<Vec<ArchiveEntry<'_>>, TarError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + BLOCK_SIZE <= data.len() {
        let header_data = &data[offset..offset + BLOCK_SIZE];

        // end of archive
        if is_empty_block(header_data) {
            break;
        }

        let header = parse_tar_header(header_data);
        let data_start = offset + BLOCK_SIZE;
        let available = data.len() - data_start;
        let data_end = usize::try_from(header.size)
            .ok()
            .filter(|&size| size <= available)
            .map(|size| data_start + size)
            .ok_or_else(|| TarError::Truncated {
                path: header.full_path(),
                offset,
                size: header.size,
                available,
            })?;

        entries.push(ArchiveEntry {
            path: header.full_path(),
            bytes: &data[data_start..data_end],
            kind: header.kind(),
            modified: header.modified(),
        });

        // Move to next entry (align to 512-byte boundary)
        offset = data_start + padded_len(data_end - data_start);
    }
    Ok(entries)
}

/// Headers of every entry whose header block lies inside `data`, in order.
///
/// Unlike [`read_tar`], a payload running past the end is not an error: its
/// header is still returned and the walk stops there. This is how the prefix
/// of a stream cut off at the inflation cap gets vetted.
pub fn scan_headers(data: &[u8]) -> Vec<TarHeader> {
    let mut headers = Vec::new();
    let mut offset = 0;
    while offset + BLOCK_SIZE <= data.len() {
        let block = &data[offset..offset + BLOCK_SIZE];
        if is_empty_block(block) {
            break;
        }

        let header = parse_tar_header(block);
        let next = usize::try_from(header.size)
            .ok()
            .and_then(|size| size.checked_next_multiple_of(BLOCK_SIZE))
            .and_then(|padded| (offset + BLOCK_SIZE).checked_add(padded));
        headers.push(header);
        match next {
            Some(next) => offset = next,
            None => break,
        }
    }
    headers
}

/// True when `data` opens with a plausible TAR header: USTAR magic or a
/// checksum that verifies.
pub fn looks_like_tar(data: &[u8]) -> bool {
    let Some(block) = data.get(..BLOCK_SIZE) else {
        return false;
    };
    let header = parse_tar_header(block);
    header.magic.starts_with("ustar") || header.verify_checksum(block)
}

/// Length rounded up to the next block boundary
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn is_empty_block(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

// text fields end at their first NUL
fn read_tar_str(data: &[u8], range: Range<usize>) -> String {
    let field = &data[range];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// octal ASCII, NUL/space padded; anything unparseable reads as 0
fn read_tar_octal(data: &[u8], range: Range<usize>) -> u64 {
    let s = read_tar_str(data, range);
    let s = s.trim_matches(|c: char| c == ' ' || c == '\0');
    if s.is_empty() {
        return 0;
    }
    u64::from_str_radix(s, 8).unwrap_or(0)
}

fn parse_tar_header(data: &[u8]) -> TarHeader {
    TarHeader {
        name: read_tar_str(data, NAME),
        mode: u32::try_from(read_tar_octal(data, MODE)).unwrap_or(0),
        size: read_tar_octal(data, SIZE),
        mtime: read_tar_octal(data, MTIME),
        checksum: u32::try_from(read_tar_octal(data, CHECKSUM)).unwrap_or(0),
        typeflag: data[TYPEFLAG],
        linkname: read_tar_str(data, LINKNAME),
        magic: read_tar_str(data, MAGIC),
        version: read_tar_str(data, VERSION),
        prefix: read_tar_str(data, PREFIX),
    }
}

// ----------------------------------------------------------------
// encoder, used to build fixtures
// ----------------------------------------------------------------

/// Tar entry owned by the encoder
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub header: TarHeader,
    pub data: Vec<u8>,
}

/// Writes entries as a TAR archive, terminated by two zero blocks
pub fn write_tar(entries: &[TarEntry]) -> Vec<u8> {
    let mut tar_data = Vec::new();
    for entry in entries {
        tar_data.extend_from_slice(&create_tar_header(&entry.header));
        tar_data.extend_from_slice(&entry.data);
        let padding = padded_len(entry.data.len()) - entry.data.len();
        tar_data.resize(tar_data.len() + padding, 0);
    }
    tar_data.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);
    tar_data
}

/// Small in-memory archive builder
#[derive(Debug, Default)]
pub struct TarBuilder {
    pub entries: Vec<TarEntry>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular file. Paths over 100 bytes are split into USTAR prefix + name.
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> &mut Self {
        let header = split_long_path(TarHeader::new(path.to_string(), 0o644, data.len() as u64));
        self.entries.push(TarEntry {
            header,
            data: data.to_vec(),
        });
        self
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.add_link(path, target, TYPE_SYMLINK)
    }

    pub fn add_hardlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.add_link(path, target, TYPE_HARDLINK)
    }

    fn add_link(&mut self, path: &str, target: &str, typeflag: u8) -> &mut Self {
        let mut header = split_long_path(TarHeader::new(path.to_string(), 0o777, 0));
        header.typeflag = typeflag;
        header.linkname = target.to_string();
        self.entries.push(TarEntry {
            header,
            data: Vec::new(),
        });
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        write_tar(&self.entries)
    }
}

fn split_long_path(mut header: TarHeader) -> TarHeader {
    if header.name.len() <= NAME.len() {
        return header;
    }
    let split = header
        .name
        .char_indices()
        .filter(|&(i, c)| c == '/' && i <= PREFIX.len() && header.name.len() - i - 1 <= NAME.len())
        .map(|(i, _)| i)
        .next();
    if let Some(i) = split {
        header.prefix = header.name[..i].to_string();
        header.name = header.name[i + 1..].to_string();
    }
    header
}

fn write_field(data: &mut [u8], range: Range<usize>, value: &[u8]) {
    let len = value.len().min(range.len());
    data[range.start..range.start + len].copy_from_slice(&value[..len]);
}

fn create_tar_header(header: &TarHeader) -> [u8; BLOCK_SIZE] {
    let mut data = [0u8; BLOCK_SIZE];
    write_field(&mut data, NAME, header.name.as_bytes());
    write_field(&mut data, MODE, format!("{:07o}", header.mode).as_bytes());
    write_field(&mut data, SIZE, format!("{:011o}", header.size).as_bytes());
    write_field(&mut data, MTIME, format!("{:011o}", header.mtime).as_bytes());
    data[TYPEFLAG] = header.typeflag;
    write_field(&mut data, LINKNAME, header.linkname.as_bytes());
    write_field(&mut data, MAGIC, header.magic.as_bytes());
    write_field(&mut data, VERSION, header.version.as_bytes());
    write_field(&mut data, PREFIX, header.prefix.as_bytes());

    let checksum = calc_checksum(&data);
    write_field(&mut data, CHECKSUM, format!("{:06o}\0 ", checksum).as_bytes());
    data
}

/// Sum of the header bytes, with the checksum field counted as spaces
pub fn calc_checksum(data: &[u8]) -> u32 {
    if data.len() < BLOCK_SIZE {
        return 0;
    }
    data.iter()
        .take(BLOCK_SIZE)
        .enumerate()
        .map(|(i, &b)| if CHECKSUM.contains(&i) { b' ' as u32 } else { b as u32 })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_file_layout() {
        let mut tar = TarBuilder::new();
        tar.add_file("a.txt", b"hi");
        let tar_data = tar.to_bytes();
        // header + content + padding + two trailer blocks
        assert_eq!(tar_data.len(), 512 + 2 + 510 + 1024);

        let entries = read_tar(&tar_data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a.txt");
        assert_eq!(entries[0].bytes, b"hi");
        assert_eq!(entries[0].kind, EntryKind::File);
    }

    #[test]
    fn payload_is_a_view_into_the_input() {
        let mut tar = TarBuilder::new();
        tar.add_file("view.txt", b"zero copy");
        let tar_data = tar.to_bytes();
        let entries = read_tar(&tar_data).unwrap();
        let start = tar_data.as_ptr() as usize;
        let payload = entries[0].bytes.as_ptr() as usize;
        assert_eq!(payload - start, BLOCK_SIZE);
    }

    #[test]
    fn scan_headers_survives_a_cut_off_payload() {
        let mut tar = TarBuilder::new();
        tar.add_file("first.txt", &[b'a'; 700])
            .add_symlink("link", "/etc/passwd")
            .add_file("huge.bin", &[b'b'; 4000]);
        let mut tar_data = tar.to_bytes();
        // keep the third header and part of its payload
        tar_data.truncate(512 + 1024 + 512 + 512 + 100);
        assert!(read_tar(&tar_data).is_err());

        let headers = scan_headers(&tar_data);
        let paths: Vec<String> = headers.iter().map(TarHeader::full_path).collect();
        assert_eq!(paths, ["first.txt", "link", "huge.bin"]);
        assert_eq!(headers[1].kind(), EntryKind::Symlink);
        assert_eq!(headers[2].size, 4000);

        // a header cut in half is not reported
        assert!(scan_headers(&tar_data[..300]).is_empty());
    }

    #[test]
    fn checksum_is_written_and_verifiable() {
        let header = TarHeader::new("test.txt".to_string(), 0o644, 33);
        let bytes = header.to_bytes();
        let parsed = TarHeader::from_bytes(&bytes);
        assert!(parsed.verify_checksum(&bytes));

        let mut corrupted = bytes;
        corrupted[148] = b'7';
        corrupted[149] = b'7';
        let parsed = TarHeader::from_bytes(&corrupted);
        assert!(!parsed.verify_checksum(&corrupted));
    }

    #[test]
    fn corrupt_checksum_does_not_stop_decoding() {
        let mut tar = TarBuilder::new();
        tar.add_file("test.txt", b"test data!");
        let mut tar_data = tar.to_bytes();
        tar_data[148] = b'9';
        tar_data[149] = b'9';
        let entries = read_tar(&tar_data).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bytes, b"test data!");
    }

    #[test]
    fn multiple_entries_are_block_aligned() {
        let big = vec![b'x'; 1500];
        let mut tar = TarBuilder::new();
        tar.add_file("one.txt", b"1").add_file("two.bin", &big).add_file("three.txt", b"333");
        let tar_data = tar.to_bytes();
        let entries = read_tar(&tar_data).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["one.txt", "two.bin", "three.txt"]);
        assert_eq!(entries[1].bytes.len(), 1500);
        assert_eq!(entries[2].bytes, b"333");
    }

    #[test]
    fn ustar_prefix_is_joined_to_name() {
        let long_path = format!("{}/{}", "dir".repeat(40), "file.json");
        assert!(long_path.len() > 100);
        let mut tar = TarBuilder::new();
        tar.add_file(&long_path, b"{}");
        assert!(!tar.entries[0].header.prefix.is_empty());

        let tar_data = tar.to_bytes();
        let entries = read_tar(&tar_data).unwrap();
        assert_eq!(entries[0].path, long_path);
    }

    #[test]
    fn typeflags_map_to_entry_kinds() {
        let mut tar = TarBuilder::new();
        tar.add_symlink("link", "/etc/passwd")
            .add_hardlink("hard", "a.txt")
            .add_file("a.txt", b"a");
        let mut dir = TarHeader::new("folder/".to_string(), 0o755, 0);
        dir.typeflag = b'5';
        tar.entries.push(TarEntry {
            header: dir,
            data: Vec::new(),
        });
        let tar_data = tar.to_bytes();
        let kinds: Vec<_> = read_tar(&tar_data).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [EntryKind::Symlink, EntryKind::Hardlink, EntryKind::File, EntryKind::File]
        );
    }

    #[test]
    fn declared_size_past_end_fails() {
        let header = TarHeader::new("incomplete.txt".to_string(), 0o644, 1000);
        let mut tar_data = Vec::new();
        tar_data.extend_from_slice(&header.to_bytes());
        tar_data.extend_from_slice(b"short");

        let err = read_tar(&tar_data).unwrap_err();
        assert_eq!(
            err,
            TarError::Truncated {
                path: "incomplete.txt".to_string(),
                offset: 0,
                size: 1000,
                available: 5,
            }
        );
    }

    #[test]
    fn huge_size_does_not_overflow() {
        let header = TarHeader::new("overflow.txt".to_string(), 0o644, u64::MAX >> 4);
        let entry = TarEntry {
            header,
            data: b"small".to_vec(),
        };
        let tar_data = write_tar(&[entry]);
        assert!(matches!(read_tar(&tar_data), Err(TarError::Truncated { .. })));
    }

    #[test]
    fn non_numeric_size_reads_as_zero() {
        let header = TarHeader::new("weird.txt".to_string(), 0o644, 0);
        let mut block = header.to_bytes();
        block[124..136].copy_from_slice(b"not-octal!!\0");
        let mut tar_data = block.to_vec();
        tar_data.extend_from_slice(&[0u8; 1024]);

        let entries = read_tar(&tar_data).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].bytes.is_empty());
    }

    #[test]
    fn empty_and_zero_only_buffers_yield_nothing() {
        assert!(read_tar(&[]).unwrap().is_empty());
        assert!(read_tar(&[0u8; 1024]).unwrap().is_empty());
        // trailing partial block is ignored
        assert!(read_tar(&[1u8; 100]).unwrap().is_empty());
    }

    #[test]
    fn name_stops_at_first_nul() {
        let header = TarHeader::new("file\0hidden.txt".to_string(), 0o644, 0);
        let tar_data = write_tar(&[TarEntry {
            header,
            data: Vec::new(),
        }]);
        assert_eq!(read_tar(&tar_data).unwrap()[0].path, "file");
    }

    #[test]
    fn tar_detection() {
        let mut tar = TarBuilder::new();
        tar.add_file("a.txt", b"a");
        let tar_data = tar.to_bytes();
        assert!(looks_like_tar(&tar_data));

        // pre-POSIX header without magic, but with a valid checksum
        let mut header = TarHeader::new("old.txt".to_string(), 0o644, 0);
        header.magic = String::new();
        header.version = String::new();
        assert!(looks_like_tar(&header.to_bytes()));

        assert!(!looks_like_tar(&[0u8; 1024]));
        assert!(!looks_like_tar(&[b'{'; 600]));
        assert!(!looks_like_tar(b"short"));
    }

    #[test]
    fn mtime_becomes_timestamp() {
        let mut header = TarHeader::new("dated.txt".to_string(), 0o644, 0);
        header.mtime = 1_700_000_000;
        let tar_data = write_tar(&[TarEntry {
            header,
            data: Vec::new(),
        }]);
        let entry = &read_tar(&tar_data).unwrap()[0];
        assert_eq!(entry.modified.map(|t| t.timestamp()), Some(1_700_000_000));

        let mut tar = TarBuilder::new();
        tar.add_file("undated.txt", b"");
        assert_eq!(read_tar(&tar.to_bytes()).unwrap()[0].modified, None);
    }
}
