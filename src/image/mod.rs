//! Memory-mapped access to the filesystem image.
//!
//! The image reader owns the mapping for the lifetime of the mount and
//! hands out borrowed slices by byte offset. Slices are pure views, so
//! concurrent readers need no synchronization.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::{Error, Result};

pub mod section;

pub use section::{SectionIndex, SectionKind};

/// Memory-locking mode for the image mapping (`mlock=none|try|must`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlockMode {
    #[default]
    None,
    Try,
    Must,
}

impl FromStr for MlockMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(MlockMode::None),
            "try" => Ok(MlockMode::Try),
            "must" => Ok(MlockMode::Must),
            other => Err(Error::Cli(format!("no such mlock mode: {other}")).into()),
        }
    }
}

#[derive(Debug)]
pub struct ImageReader {
    path: PathBuf,
    map: Mmap,
}

impl ImageReader {
    /// Map the image file read-only and apply the requested locking mode.
    pub fn open(path: impl AsRef<Path>, mlock: MlockMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Safety contract of memmap2: the file must not be truncated while
        // mapped. Images are immutable once written by the packer.
        let map = unsafe { Mmap::map(&file)? };

        match mlock {
            MlockMode::None => {}
            MlockMode::Try => {
                if let Err(e) = map.lock() {
                    warn!(
                        image = %path.display(),
                        error = %e,
                        "failed to lock image memory, continuing unlocked"
                    );
                }
            }
            MlockMode::Must => {
                map.lock().map_err(|e| {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("mlock of {} failed: {e}", path.display()),
                    ))
                })?;
            }
        }

        debug!(image = %path.display(), bytes = map.len(), mode = ?mlock, "image mapped");

        Ok(Self { path, map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow `length` bytes starting at `offset`.
    ///
    /// Returns `CorruptImage` when the range runs past the end of the
    /// mapping; sections that claim more bytes than the image holds are a
    /// format violation, not an I/O failure.
    pub fn slice(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::CorruptImage(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.map.len())
            .ok_or_else(|| {
                Error::CorruptImage(format!(
                    "range {offset}+{length} exceeds image size {}",
                    self.map.len()
                ))
            })?;
        Ok(&self.map[start..end])
    }

    /// Advise the kernel whether to keep the compressed image resident
    /// (`cache_image` option). Best-effort; failures are only logged.
    pub fn advise_cache_image(&self, keep: bool) {
        let result = if keep {
            self.map.advise(memmap2::Advice::WillNeed)
        } else {
            // DontNeed is harmless on a read-only shared file mapping: the
            // kernel refills dropped pages from the image file.
            unsafe { self.map.unchecked_advise(memmap2::UncheckedAdvice::DontNeed) }
        };
        if let Err(e) = result {
            debug!(error = %e, keep, "madvise on image mapping failed");
        }
    }
}
