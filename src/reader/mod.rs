//! Inode reader: translates `(inode, offset, size)` into a gather read
//! over cached blocks.
//!
//! Each open file handle carries a sequential-access detector; once a
//! handle has served enough consecutive reads it flips to streaming mode
//! and prefetches the blocks behind the current position.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::cache::BlockCache;
use crate::metadata::{Chunk, MetadataView};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Bytes to prefetch ahead of a streaming reader (0 disables).
    pub readahead: u64,
    /// Consecutive-read streak that switches a handle to streaming mode.
    pub seq_detector_threshold: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            readahead: 0,
            seq_detector_threshold: 4,
        }
    }
}

#[derive(Debug, Default)]
struct SeqDetector {
    last_end: u64,
    streak: usize,
    streaming: bool,
}

/// A pinned view into one cached block. The `Arc` keeps the block's bytes
/// alive until the reply has been consumed, independent of eviction.
#[derive(Debug, Clone)]
pub struct BlockSlice {
    bytes: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl BlockSlice {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct InodeReader {
    meta: Arc<MetadataView>,
    cache: Arc<BlockCache>,
    opts: ReaderOptions,
    detectors: DashMap<u64, SeqDetector>,
}

impl InodeReader {
    pub fn new(meta: Arc<MetadataView>, cache: Arc<BlockCache>, opts: ReaderOptions) -> Self {
        Self {
            meta,
            cache,
            opts,
            detectors: DashMap::new(),
        }
    }

    /// Register a handle's detector state. The host owns handle lifetime.
    pub fn open_handle(&self, fh: u64) {
        self.detectors.insert(fh, SeqDetector::default());
    }

    pub fn release_handle(&self, fh: u64) {
        self.detectors.remove(&fh);
    }

    /// Scatter-gather read returning pinned slices of cached blocks.
    pub fn readv(&self, ino: u64, size: usize, offset: u64, fh: u64) -> Result<Vec<BlockSlice>> {
        let file_size = self.meta.file_size(ino)?;

        if size == 0 || offset >= file_size {
            self.track(fh, offset, 0, file_size, &[]);
            return Ok(Vec::new());
        }

        let chunks = self.meta.chunks(ino)?;
        let want = ((file_size - offset) as usize).min(size);

        // Cumulative chunk start offsets for the containing-chunk bisect.
        let mut starts = Vec::with_capacity(chunks.len());
        let mut acc = 0u64;
        for c in chunks {
            starts.push(acc);
            acc += u64::from(c.size);
        }

        let mut idx = starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let mut pos = offset;
        let mut remaining = want;
        let mut out = Vec::new();

        while remaining > 0 && idx < chunks.len() {
            let chunk = &chunks[idx];
            let within = (pos - starts[idx]) as usize;
            let take = (chunk.size as usize - within).min(remaining);

            let block = self.cache.get(chunk.block)?;
            let begin = chunk.offset as usize + within;
            if begin + take > block.len() {
                return Err(Error::CorruptImage(format!(
                    "chunk for inode {ino} references {}..{} in block {} of {} bytes",
                    begin,
                    begin + take,
                    chunk.block,
                    block.len()
                ))
                .into());
            }

            out.push(BlockSlice {
                bytes: block,
                offset: begin,
                len: take,
            });
            pos += take as u64;
            remaining -= take;
            idx += 1;
        }

        let served: usize = out.iter().map(|s| s.len).sum();
        self.track(fh, offset, served as u64, file_size, chunks);
        Ok(out)
    }

    /// Plain read: gather into one contiguous buffer.
    pub fn read(&self, ino: u64, size: usize, offset: u64, fh: u64) -> Result<Vec<u8>> {
        let slices = self.readv(ino, size, offset, fh)?;
        let total = slices.iter().map(BlockSlice::len).sum();
        let mut buf = Vec::with_capacity(total);
        for s in &slices {
            buf.extend_from_slice(s.as_slice());
        }
        Ok(buf)
    }

    /// Update the handle's sequential detector and issue readahead while
    /// in streaming mode.
    fn track(&self, fh: u64, offset: u64, served: u64, file_size: u64, chunks: &[Chunk]) {
        let mut detector = self.detectors.entry(fh).or_default();

        if offset == detector.last_end && served > 0 {
            detector.streak += 1;
        } else if offset != detector.last_end {
            detector.streak = 0;
            detector.streaming = false;
        }
        detector.last_end = offset + served;

        if !detector.streaming && detector.streak >= self.opts.seq_detector_threshold {
            detector.streaming = true;
            trace!(fh, "switching to streaming mode");
        }

        let streaming = detector.streaming;
        let next = detector.last_end;
        drop(detector);

        if streaming && self.opts.readahead > 0 && next < file_size {
            self.prefetch_range(chunks, next, self.opts.readahead);
        }
    }

    /// Prefetch the blocks covering `[start, start + len)` of the file.
    fn prefetch_range(&self, chunks: &[Chunk], start: u64, len: u64) {
        let end = start.saturating_add(len);
        let mut acc = 0u64;
        let mut last_block = None;
        for c in chunks {
            let chunk_start = acc;
            acc += u64::from(c.size);
            if acc <= start {
                continue;
            }
            if chunk_start >= end {
                break;
            }
            if last_block != Some(c.block) {
                self.cache.prefetch(c.block);
                last_block = Some(c.block);
            }
        }
    }
}
