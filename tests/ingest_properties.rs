use flate2::Compression;
use flate2::write::GzEncoder;
use package_ingest::tar::TarBuilder;
use package_ingest::{
    ImportOptions, LimitOverrides, PackageParseErrorCode, PackageType, ParsedImportPackage, RawFilesSelector,
    parse_import_payload,
};
use proptest::prelude::*;
use std::io::{Cursor, Write};
use zip::ZipWriter;
use zip::write::FileOptions;

fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn gzip_of(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn ingest(file_name: &str, bytes: &[u8], limits: LimitOverrides) -> package_ingest::Result<ParsedImportPackage> {
    let options = ImportOptions {
        selected_source: None,
        limits,
    };
    parse_import_payload(file_name, bytes, &options, &RawFilesSelector)
}

fn code(file_name: &str, bytes: &[u8], limits: LimitOverrides) -> PackageParseErrorCode {
    ingest(file_name, bytes, limits).unwrap_err().code
}

fn depth(n: u32) -> LimitOverrides {
    LimitOverrides {
        max_nested_archive_depth: Some(n),
        ..Default::default()
    }
}

#[test]
fn zip_export_is_ingested() {
    let bytes = zip_of(&[
        ("Takeout/Mail/labels.json", &b"[\"inbox\"]"[..]),
        ("Takeout/Calendar/work.ics", &b"BEGIN:VCALENDAR"[..]),
    ]);
    let parsed = ingest("takeout-2024.zip", &bytes, LimitOverrides::default()).unwrap();
    assert_eq!(parsed.package_type, PackageType::Zip);
    assert_eq!(parsed.source_type, "raw");
    assert_eq!(parsed.file_count, 2);
    assert_eq!(parsed.total_uncompressed_bytes, 9 + 15);
    assert_eq!(parsed.records[1]["text"], "BEGIN:VCALENDAR");
}

#[test]
fn tgz_export_is_ingested() {
    let mut tar = TarBuilder::new();
    tar.add_file("orders/2023.json", b"[]").add_file("orders/2024.json", b"[{}]");
    let parsed = ingest("amazon.tar.gz", &gzip_of(&tar.to_bytes()), LimitOverrides::default()).unwrap();
    assert_eq!(parsed.package_type, PackageType::Tgz);
    assert_eq!(parsed.file_count, 2);
    assert_eq!(parsed.total_uncompressed_bytes, 6);
}

#[test]
fn zip_named_file_without_magic_is_spoofed() {
    let inputs: [&[u8]; 4] = [b"{}", b"", b"\x1f\x8b\x08\x00", b"PK\x01\x02"];
    for bytes in inputs {
        assert_eq!(code("export.zip", bytes, LimitOverrides::default()), PackageParseErrorCode::FormatSpoofed);
    }
}

#[test]
fn trailing_symlink_is_rejected() {
    let mut tar = TarBuilder::new();
    tar.add_file("a.json", b"{}").add_file("b.json", b"{}").add_symlink("z-link", "../../etc/passwd");
    assert_eq!(
        code("export.tgz", &gzip_of(&tar.to_bytes()), LimitOverrides::default()),
        PackageParseErrorCode::SymlinkEntryRejected
    );
}

#[test]
fn hardlink_is_rejected() {
    let mut tar = TarBuilder::new();
    tar.add_file("a.json", b"{}").add_hardlink("b.json", "a.json");
    assert_eq!(
        code("export.tgz", &gzip_of(&tar.to_bytes()), LimitOverrides::default()),
        PackageParseErrorCode::HardlinkEntryRejected
    );
}

#[test]
fn traversal_is_rejected_before_counting() {
    // one entry allowed: counting the traversal entry first would report MAX_ENTRIES_EXCEEDED
    let limits = LimitOverrides {
        max_archive_entries: Some(1),
        ..Default::default()
    };
    let top = zip_of(&[("ok.txt", &b"1"[..]), ("../evil.txt", &b"2"[..])]);
    assert_eq!(code("export.zip", &top, limits), PackageParseErrorCode::PathTraversal);

    let mut tar = TarBuilder::new();
    tar.add_file("deep/../../evil.txt", b"x");
    let nested = zip_of(&[("inner/backup.tgz", &gzip_of(&tar.to_bytes())[..])]);
    assert_eq!(code("export.zip", &nested, LimitOverrides::default()), PackageParseErrorCode::PathTraversal);
}

#[test]
fn unsafe_or_link_member_beats_an_inflation_overflow() {
    let one_mib = LimitOverrides {
        max_single_file_bytes: Some(1024 * 1024),
        ..Default::default()
    };
    let two_mib = vec![b'a'; 2 * 1024 * 1024];
    let zipped = zip_of(&[("../evil.txt", &two_mib[..])]);
    assert_eq!(code("export.zip", &zipped, one_mib), PackageParseErrorCode::PathTraversal);

    let tight = LimitOverrides {
        max_uncompressed_bytes: Some(64 * 1024),
        max_archive_entries: Some(4),
        ..Default::default()
    };
    let filler = vec![b'b'; 200 * 1024];
    let zipped = zip_of(&[("ok.txt", &b"1"[..]), ("../evil.txt", &b"2"[..]), ("filler.bin", &filler[..])]);
    assert_eq!(code("export.zip", &zipped, tight), PackageParseErrorCode::PathTraversal);

    let mut tar = TarBuilder::new();
    tar.add_file("../evil.txt", b"x").add_file("filler.bin", &filler);
    assert_eq!(code("export.tgz", &gzip_of(&tar.to_bytes()), tight), PackageParseErrorCode::PathTraversal);

    let mut tar = TarBuilder::new();
    tar.add_symlink("link", "/etc/passwd").add_file("filler.bin", &filler);
    assert_eq!(
        code("export.tgz", &gzip_of(&tar.to_bytes()), tight),
        PackageParseErrorCode::SymlinkEntryRejected
    );
}

#[test]
fn nested_entries_trip_the_entry_ceiling() {
    let limits = LimitOverrides {
        max_archive_entries: Some(5),
        ..Default::default()
    };
    let files: Vec<(String, Vec<u8>)> = (0..5).map(|i| (format!("part{i}.json"), b"{}".to_vec())).collect();
    let members: Vec<(&str, &[u8])> = files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
    // two top-level entries plus five nested ones
    let outer = zip_of(&[("readme.txt", &b"hi"[..]), ("parts.zip", &zip_of(&members)[..])]);
    assert_eq!(code("export.zip", &outer, limits), PackageParseErrorCode::MaxEntriesExceeded);

    let mut tar = TarBuilder::new();
    for (name, data) in &files {
        tar.add_file(name, data);
    }
    let outer = zip_of(&[("readme.txt", &b"hi"[..]), ("parts.tgz", &gzip_of(&tar.to_bytes())[..])]);
    assert_eq!(code("export.zip", &outer, limits), PackageParseErrorCode::MaxEntriesExceeded);

    let roomy = LimitOverrides {
        max_archive_entries: Some(7),
        ..Default::default()
    };
    assert_eq!(ingest("export.zip", &outer, roomy).unwrap().file_count, 7);
}

#[test]
fn nested_zip_depth_boundary() {
    let innermost = zip_of(&[("leaf.json", &b"{}"[..])]);
    let middle = zip_of(&[("innermost.zip", &innermost[..])]);
    let outer = zip_of(&[("middle.zip", &middle[..])]);

    assert_eq!(code("outer.zip", &outer, depth(2)), PackageParseErrorCode::NestedArchiveDepthExceeded);
    let parsed = ingest("outer.zip", &outer, depth(3)).unwrap();
    // only the top-level entry is decoded and handed on
    assert_eq!(parsed.records.len(), 1);
    assert_eq!(parsed.file_count, 3);
}

#[test]
fn oversized_single_file_is_rejected() {
    let limits = LimitOverrides {
        max_single_file_bytes: Some(1024 * 1024),
        ..Default::default()
    };
    let big = vec![b'a'; 10 * 1024 * 1024];
    assert_eq!(code("dump.json", &big, limits), PackageParseErrorCode::MaxSingleFileBytesExceeded);

    let zipped = zip_of(&[("dump.json", &big[..])]);
    assert_eq!(code("dump.zip", &zipped, limits), PackageParseErrorCode::MaxSingleFileBytesExceeded);
}

#[test]
fn plain_json_under_defaults() {
    let parsed = ingest("conversations.json", br#"{"conversations": []}"#, LimitOverrides::default()).unwrap();
    assert_eq!(parsed.package_type, PackageType::Json);
    assert_eq!(parsed.file_count, 1);
    assert_eq!(parsed.records.len(), 1);
}

#[test]
fn truncated_tar_is_adapter_failure() {
    let mut tar = TarBuilder::new();
    tar.add_file("big.json", &[b' '; 2000]);
    let mut bytes = tar.to_bytes();
    bytes.truncate(512 + 100);
    assert_eq!(
        code("export.tgz", &gzip_of(&bytes), LimitOverrides::default()),
        PackageParseErrorCode::AdapterParseFailed
    );
}

#[test]
fn gzip_bomb_is_stopped_by_total_budget() {
    let limits = LimitOverrides {
        max_uncompressed_bytes: Some(64 * 1024),
        ..Default::default()
    };
    let bomb = gzip_of(&vec![0u8; 4 * 1024 * 1024]);
    assert_eq!(code("bomb.tgz", &bomb, limits), PackageParseErrorCode::MaxUncompressedBytesExceeded);
}

#[test]
fn unsupported_binary_upload() {
    assert_eq!(
        code("photo.heic", b"\0\0\0\x18ftypheic", LimitOverrides::default()),
        PackageParseErrorCode::UnsupportedFormat
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn totals_never_exceed_ceilings(
        sizes in proptest::collection::vec(0usize..400, 1..12),
        nest in any::<bool>(),
        max_bytes in 200u64..3000,
        max_entries in 1usize..10,
    ) {
        let payloads: Vec<Vec<u8>> = sizes.iter().map(|&n| vec![b'x'; n]).collect();
        let names: Vec<String> = (0..payloads.len()).map(|i| format!("f{i}.txt")).collect();
        let files: Vec<(&str, &[u8])> = names.iter().map(String::as_str).zip(payloads.iter().map(Vec::as_slice)).collect();
        let inner = zip_of(&files);
        let bytes = if nest { zip_of(&[("nested.zip", &inner[..])]) } else { inner };

        let limits = LimitOverrides {
            max_uncompressed_bytes: Some(max_bytes),
            max_archive_entries: Some(max_entries),
            ..Default::default()
        };
        if let Ok(parsed) = ingest("export.zip", &bytes, limits) {
            prop_assert!(parsed.file_count <= max_entries);
            prop_assert!(parsed.total_uncompressed_bytes <= max_bytes);
        }
    }
}
