//! Section layout of a filesystem image.
//!
//! An image is a run of consecutive sections, each a fixed 32-byte header
//! followed by its payload. The index locates the metadata section and
//! numbers the block sections in image order; every payload checksum is
//! verified at mount so corruption is caught before the driver starts
//! serving reads.

use std::str::FromStr;

use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::cache::codec::Codec;
use crate::image::ImageReader;
use crate::{Error, Result};

pub const SECTION_MAGIC: &[u8; 6] = b"DWARFS";
pub const SECTION_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Block,
    Metadata,
}

impl SectionKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SectionKind::Block),
            1 => Some(SectionKind::Metadata),
            _ => None,
        }
    }
}

/// Image byte offset option: explicit offset or signature auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageOffset {
    #[default]
    Explicit0,
    Explicit(u64),
    Auto,
}

impl ImageOffset {
    pub fn explicit(offset: u64) -> Self {
        if offset == 0 {
            ImageOffset::Explicit0
        } else {
            ImageOffset::Explicit(offset)
        }
    }
}

impl FromStr for ImageOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ImageOffset::Auto);
        }
        let off = s
            .parse::<u64>()
            .map_err(|_| Error::Cli(format!("invalid image offset: {s}")))?;
        Ok(ImageOffset::explicit(off))
    }
}

/// One decoded section header plus the location of its payload.
#[derive(Debug, Clone, Copy)]
pub struct SectionEntry {
    pub kind: SectionKind,
    pub codec: Codec,
    pub payload_offset: u64,
    pub payload_len: u64,
    pub checksum: u64,
}

/// Mapping from section kind to image locations, built once at mount.
#[derive(Debug)]
pub struct SectionIndex {
    blocks: Vec<SectionEntry>,
    metadata: SectionEntry,
}

impl SectionIndex {
    /// Scan the image starting at `offset` and build the index.
    ///
    /// With `ImageOffset::Auto` the scan walks forward byte by byte until
    /// the first valid section signature; this supports images embedded
    /// behind launchers or archive headers.
    pub fn scan(image: &ImageReader, offset: ImageOffset) -> Result<Self> {
        let start = match offset {
            ImageOffset::Explicit0 => 0,
            ImageOffset::Explicit(off) => off,
            ImageOffset::Auto => find_signature(image)?,
        };

        let mut blocks = Vec::new();
        let mut metadata: Option<SectionEntry> = None;
        let mut pos = start;
        let image_len = image.len() as u64;

        while pos < image_len {
            let entry = decode_header(image, pos)?;
            verify_checksum(image, &entry)?;

            match entry.kind {
                SectionKind::Block => blocks.push(entry),
                SectionKind::Metadata => {
                    if metadata.replace(entry).is_some() {
                        return Err(Error::CorruptImage(
                            "duplicate metadata section".to_string(),
                        )
                        .into());
                    }
                }
            }

            pos = entry.payload_offset + entry.payload_len;
        }

        let metadata = metadata
            .ok_or_else(|| Error::CorruptImage("missing metadata section".to_string()))?;

        info!(
            blocks = blocks.len(),
            metadata_bytes = metadata.payload_len,
            image_offset = start,
            "section index built"
        );

        Ok(Self { blocks, metadata })
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn block(&self, id: u32) -> Result<&SectionEntry> {
        self.blocks
            .get(id as usize)
            .ok_or_else(|| Error::CorruptImage(format!("no such block: {id}")).into())
    }

    pub fn metadata(&self) -> &SectionEntry {
        &self.metadata
    }
}

fn decode_header(image: &ImageReader, offset: u64) -> Result<SectionEntry> {
    let hdr = image.slice(offset, HEADER_LEN).map_err(|_| {
        Error::CorruptImage(format!("truncated section header at offset {offset}"))
    })?;

    if &hdr[0..6] != SECTION_MAGIC {
        return Err(
            Error::CorruptImage(format!("bad section magic at offset {offset}")).into(),
        );
    }
    if hdr[6] != SECTION_VERSION {
        return Err(Error::CorruptImage(format!(
            "unsupported section version {} at offset {offset}",
            hdr[6]
        ))
        .into());
    }

    let kind = SectionKind::from_raw(hdr[7]).ok_or_else(|| {
        Error::CorruptImage(format!("unknown section kind {} at offset {offset}", hdr[7]))
    })?;
    let codec = Codec::from_raw(hdr[8]).ok_or_else(|| {
        Error::CorruptImage(format!("unknown codec {} at offset {offset}", hdr[8]))
    })?;
    // Bytes 9..16 are reserved padding.
    let payload_len = u64::from_le_bytes(hdr[16..24].try_into().unwrap());
    let checksum = u64::from_le_bytes(hdr[24..32].try_into().unwrap());

    Ok(SectionEntry {
        kind,
        codec,
        payload_offset: offset + HEADER_LEN as u64,
        payload_len,
        checksum,
    })
}

fn verify_checksum(image: &ImageReader, entry: &SectionEntry) -> Result<()> {
    let payload = image
        .slice(entry.payload_offset, entry.payload_len as usize)
        .map_err(|_| {
            Error::CorruptImage(format!(
                "truncated section payload at offset {}",
                entry.payload_offset
            ))
        })?;
    let actual = xxh3_64(payload);
    if actual != entry.checksum {
        return Err(Error::CorruptImage(format!(
            "checksum mismatch in {:?} section at offset {}: stored {:016x}, computed {actual:016x}",
            entry.kind,
            entry.payload_offset - HEADER_LEN as u64,
            entry.checksum
        ))
        .into());
    }
    Ok(())
}

/// Locate the first valid section signature for `offset=auto`.
fn find_signature(image: &ImageReader) -> Result<u64> {
    let len = image.len();
    if len < HEADER_LEN {
        return Err(Error::CorruptImage("image too small".to_string()).into());
    }

    let haystack = image.slice(0, len)?;
    let mut pos = 0usize;
    while let Some(found) = find_magic(&haystack[pos..]) {
        let candidate = pos + found;
        // A magic match alone is not enough; require a decodable header so
        // stray "DWARFS" bytes in a prefix do not derail the scan.
        if decode_header(image, candidate as u64).is_ok() {
            debug!(offset = candidate, "auto-detected image offset");
            return Ok(candidate as u64);
        }
        pos = candidate + 1;
    }

    Err(Error::CorruptImage("no section signature found".to_string()).into())
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(SECTION_MAGIC.len())
        .position(|w| w == SECTION_MAGIC)
}
