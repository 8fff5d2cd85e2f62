//! Section index construction and corruption detection.

#[path = "../common/mod.rs"]
mod common;

use common::{dir, file, write_raw_section, write_section, ImageBuilder, KIND_BLOCK};
use dwarfs::cache::Codec;
use dwarfs::image::{section::ImageOffset, ImageReader, MlockMode, SectionIndex};
use dwarfs::Error;
use tempfile::tempdir;

fn map_bytes(bytes: &[u8]) -> (tempfile::TempDir, ImageReader) {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("img");
    std::fs::write(&path, bytes).unwrap();
    let image = ImageReader::open(&path, MlockMode::None).unwrap();
    (tmp, image)
}

fn expect_corrupt(err: anyhow::Error) {
    let domain = err.downcast_ref::<Error>().expect("domain error");
    assert!(matches!(domain, Error::CorruptImage(_)), "got {domain:?}");
}

#[test]
fn scan_indexes_blocks_and_metadata() {
    let image = ImageBuilder::new()
        .block_size(1024)
        .build(&dir(vec![("f", file(vec![7u8; 3000]))]));
    let (_tmp, map) = map_bytes(&image);

    let index = SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap();
    // 3000 bytes at block size 1024 -> three blocks.
    assert_eq!(index.block_count(), 3);
    assert!(index.metadata().payload_len > 0);
    for id in 0..3 {
        assert!(index.block(id).is_ok());
    }
    expect_corrupt(index.block(3).unwrap_err());
}

#[test]
fn auto_offset_skips_leading_garbage() {
    let mut bytes = b"#!/bin/sh\nexec something\n".to_vec();
    let image = ImageBuilder::new().build(&dir(vec![("f", file(b"payload"))]));
    let prefix_len = bytes.len() as u64;
    bytes.extend_from_slice(&image);
    let (_tmp, map) = map_bytes(&bytes);

    let index = SectionIndex::scan(&map, ImageOffset::Auto).unwrap();
    assert_eq!(index.block_count(), 1);

    // The same offset works when given explicitly.
    let explicit = SectionIndex::scan(&map, ImageOffset::explicit(prefix_len)).unwrap();
    assert_eq!(explicit.block_count(), 1);
}

#[test]
fn auto_offset_skips_stray_magic_in_prefix() {
    // A prefix containing the magic bytes without a valid header must not
    // derail the scan.
    let mut bytes = b"DWARFS is mounted by this launcher\n".to_vec();
    let image = ImageBuilder::new().build(&dir(vec![("f", file(b"payload"))]));
    bytes.extend_from_slice(&image);
    let (_tmp, map) = map_bytes(&bytes);

    let index = SectionIndex::scan(&map, ImageOffset::Auto).unwrap();
    assert_eq!(index.block_count(), 1);
}

#[test]
fn checksum_mismatch_is_corrupt_image() {
    let payload = common::compress(Codec::Zstd, b"block bytes");
    let mut bytes = Vec::new();
    write_raw_section(&mut bytes, KIND_BLOCK, Codec::Zstd.as_raw(), &payload, 0xdead_beef);
    let (_tmp, map) = map_bytes(&bytes);

    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap_err());
}

#[test]
fn missing_metadata_is_corrupt_image() {
    let mut bytes = Vec::new();
    write_section(&mut bytes, KIND_BLOCK, Codec::Null, b"just a block");
    let (_tmp, map) = map_bytes(&bytes);

    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap_err());
}

#[test]
fn duplicate_metadata_is_corrupt_image() {
    let mut bytes = Vec::new();
    write_section(&mut bytes, common::KIND_METADATA, Codec::Null, b"{}");
    write_section(&mut bytes, common::KIND_METADATA, Codec::Null, b"{}");
    let (_tmp, map) = map_bytes(&bytes);

    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap_err());
}

#[test]
fn truncated_header_is_corrupt_image() {
    let mut bytes = Vec::new();
    write_section(&mut bytes, KIND_BLOCK, Codec::Null, b"0123456789");
    // Chop into the trailing section header of a second section.
    write_section(&mut bytes, common::KIND_METADATA, Codec::Null, b"{}");
    let cut = bytes.len() - 2 - 16;
    bytes.truncate(cut);
    let (_tmp, map) = map_bytes(&bytes);

    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap_err());
}

#[test]
fn truncated_payload_is_corrupt_image() {
    let mut bytes = Vec::new();
    write_section(&mut bytes, KIND_BLOCK, Codec::Null, b"0123456789");
    bytes.truncate(bytes.len() - 4);
    let (_tmp, map) = map_bytes(&bytes);

    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Explicit0).unwrap_err());
}

#[test]
fn garbage_without_signature_is_corrupt_image() {
    let (_tmp, map) = map_bytes(&vec![0x42u8; 4096]);
    expect_corrupt(SectionIndex::scan(&map, ImageOffset::Auto).unwrap_err());
}
