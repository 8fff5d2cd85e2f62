//! Per-section codecs.
//!
//! The cache treats codecs as opaque: `decompress(bytes) -> bytes`. The
//! codec id travels in the section header.

use std::io::Read;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Null,
    Zlib,
    Lz4,
    Zstd,
}

impl Codec {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Codec::Null),
            1 => Some(Codec::Zlib),
            2 => Some(Codec::Lz4),
            3 => Some(Codec::Zstd),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Codec::Null => 0,
            Codec::Zlib => 1,
            Codec::Lz4 => 2,
            Codec::Zstd => 3,
        }
    }

    /// Decompress a full section payload into a plain byte buffer.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Null => Ok(data.to_vec()),
            Codec::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Decompress(format!("zlib: {e}")))?;
                Ok(out)
            }
            Codec::Lz4 => lz4_flex::block::decompress_size_prepended(data)
                .map_err(|e| Error::Decompress(format!("lz4: {e}")).into()),
            Codec::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| Error::Decompress(format!("zstd: {e}")).into()),
        }
    }
}
