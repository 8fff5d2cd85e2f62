//! Filesystem facade and mount session types.
//!
//! `DwarFs` is the stateless operation surface between the kernel-protocol
//! glue and the metadata/cache/reader components: every method emits one
//! structured debug line on entry, times itself under the perfmon scope,
//! and funnels errors through the uniform errno translation in `lib.rs`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{BlockCache, CacheOptions, TidyConfig};
use crate::cli::options::MountOptions;
use crate::image::{ImageReader, SectionIndex};
use crate::metadata::{
    DirHandle, FileKind, FileStat, MetadataOptions, MetadataView, VfsStat,
};
use crate::perfmon::{PerfMon, PerfTimer};
use crate::reader::{BlockSlice, InodeReader, ReaderOptions};
use crate::{Error, Result};

pub mod fuse;

pub const PID_XATTR: &str = "user.dwarfs.driver.pid";
pub const PERFMON_XATTR: &str = "user.dwarfs.driver.perfmon";
pub const INODEINFO_XATTR: &str = "user.dwarfs.inodeinfo";

/// Extra probe slack for the perfmon xattr: the summary can grow between
/// the size probe and the fetch.
const PERFMON_PROBE_SLACK: usize = 4096;

const PERFMON_SCOPE: &str = "fuse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSessionState {
    Starting,
    Ready,
    Unmounted,
}

/// Identity and lifecycle of one mount, carried through logs.
#[derive(Debug, Clone)]
pub struct MountSession {
    pub mount_id: uuid::Uuid,
    pub image_path: PathBuf,
    pub mountpoint: PathBuf,
    pub started_at: std::time::SystemTime,
    pub state: MountSessionState,
}

impl MountSession {
    pub fn new(image: impl AsRef<Path>, mountpoint: impl AsRef<Path>) -> Self {
        Self {
            mount_id: uuid::Uuid::new_v4(),
            image_path: image.as_ref().to_path_buf(),
            mountpoint: mountpoint.as_ref().to_path_buf(),
            started_at: std::time::SystemTime::now(),
            state: MountSessionState::Starting,
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = MountSessionState::Ready;
    }

    pub fn mark_unmounted(&mut self) {
        self.state = MountSessionState::Unmounted;
    }
}

/// Reply to a getxattr/listxattr call following the probe protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    Size(usize),
    Data(Vec<u8>),
}

pub struct DwarFs {
    image: Arc<ImageReader>,
    meta: Arc<MetadataView>,
    cache: Arc<BlockCache>,
    reader: InodeReader,
    perfmon: Option<Arc<PerfMon>>,
    tidy: TidyConfig,
    cache_files: bool,
    next_fh: AtomicU64,
}

impl DwarFs {
    /// Bring up the full stack over an image file: map it, build the
    /// section index, parse metadata, and wire cache and reader. Worker
    /// and tidy threads are not started here; `post_fork_init` runs them
    /// once daemonization is settled.
    pub fn open(image_path: impl AsRef<Path>, opts: &MountOptions) -> Result<Self> {
        let image = Arc::new(ImageReader::open(&image_path, opts.mlock)?);
        image.advise_cache_image(opts.cache_image);

        let sections = Arc::new(SectionIndex::scan(&image, opts.image_offset)?);

        let meta_section = sections.metadata();
        let payload = image.slice(meta_section.payload_offset, meta_section.payload_len as usize)?;
        let decoded = meta_section.codec.decompress(payload)?;
        let meta = Arc::new(MetadataView::parse(
            &decoded,
            MetadataOptions {
                enable_nlink: opts.enable_nlink,
                readonly: opts.readonly,
                block_size: opts.blocksize,
            },
        )?);

        let cache = Arc::new(BlockCache::new(
            Arc::clone(&image),
            Arc::clone(&sections),
            &CacheOptions {
                max_bytes: opts.cachesize,
                num_workers: opts.workers,
                decompress_ratio: opts.decratio,
                init_workers: false,
            },
        ));

        let reader = InodeReader::new(
            Arc::clone(&meta),
            Arc::clone(&cache),
            ReaderOptions {
                readahead: opts.readahead,
                seq_detector_threshold: opts.seq_detector,
            },
        );

        let perfmon = PerfMon::create(opts.perfmon.iter().cloned(), opts.perfmon_trace.as_deref())?;

        info!(
            image = %image.path().display(),
            blocks = sections.block_count(),
            inodes = meta.inode_count(),
            symlinks = meta.has_symlinks(),
            "file system initialized"
        );

        Ok(Self {
            image,
            meta,
            cache,
            reader,
            perfmon,
            tidy: opts.tidy,
            cache_files: opts.cache_files,
            next_fh: AtomicU64::new(1),
        })
    }

    /// Start worker and tidy threads. Must run after the driver has
    /// forked into the background so the threads live in the child.
    pub fn post_fork_init(&self) {
        self.cache.set_num_workers(self.cache.configured_workers());
        self.cache.set_tidy_config(self.tidy);
    }

    fn timer(&self, op: &'static str) -> Option<PerfTimer> {
        self.perfmon
            .as_ref()
            .and_then(|p| p.timer(PERFMON_SCOPE, op))
    }

    pub fn perfmon(&self) -> Option<&Arc<PerfMon>> {
        self.perfmon.as_ref()
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Diagnostic: whether a block currently has a ready cache entry.
    pub fn block_resident(&self, block_id: u32) -> bool {
        self.cache.is_resident(block_id)
    }

    pub fn keep_file_cache(&self) -> bool {
        self.cache_files
    }

    pub fn find(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        let _t = self.timer("op_lookup");
        debug!(parent, name, "lookup");
        self.meta.find(parent, name)
    }

    pub fn find_path(&self, path: &str) -> Result<Option<u64>> {
        let _t = self.timer("op_lookup");
        debug!(path, "lookup_path");
        self.meta.find_path(path)
    }

    pub fn getattr(&self, ino: u64) -> Result<FileStat> {
        let _t = self.timer("op_getattr");
        debug!(ino, "getattr");
        self.meta.getattr(ino)
    }

    pub fn access(&self, ino: u64, mode: i32, uid: u32, gid: u32) -> Result<()> {
        let _t = self.timer("op_access");
        debug!(ino, mode, uid, gid, "access");
        self.meta.access(ino, mode, uid, gid)
    }

    pub fn readlink(&self, ino: u64) -> Result<String> {
        let _t = self.timer("op_readlink");
        debug!(ino, "readlink");
        self.meta.readlink(ino)
    }

    /// Validate an open request and hand out a file handle with its
    /// per-handle sequential detector.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64> {
        let _t = self.timer("op_open");
        debug!(ino, flags, "open");

        let st = self.meta.getattr(ino)?;
        if st.kind == FileKind::Directory {
            return Err(Error::IsDir.into());
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY
            || flags & (libc::O_APPEND | libc::O_TRUNC) != 0
        {
            return Err(Error::AccessDenied.into());
        }

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.reader.open_handle(fh);
        Ok(fh)
    }

    pub fn release(&self, fh: u64) {
        debug!(fh, "release");
        self.reader.release_handle(fh);
    }

    pub fn read(&self, ino: u64, size: usize, offset: u64, fh: u64) -> Result<Vec<u8>> {
        let _t = self.timer("op_read");
        debug!(ino, size, offset, fh, "read");
        self.reader.read(ino, size, offset, fh)
    }

    pub fn readv(&self, ino: u64, size: usize, offset: u64, fh: u64) -> Result<Vec<BlockSlice>> {
        let _t = self.timer("op_read");
        debug!(ino, size, offset, fh, "readv");
        self.reader.readv(ino, size, offset, fh)
    }

    pub fn opendir(&self, ino: u64) -> Result<DirHandle> {
        let _t = self.timer("op_opendir");
        debug!(ino, "opendir");
        self.meta.opendir(ino)
    }

    pub fn readdir(&self, handle: &DirHandle, offset: usize) -> Option<(u64, String)> {
        self.meta.readdir(handle, offset)
    }

    pub fn dirsize(&self, handle: &DirHandle) -> usize {
        self.meta.dirsize(handle)
    }

    pub fn parent(&self, ino: u64) -> Result<u64> {
        self.meta.parent(ino)
    }

    pub fn statvfs(&self) -> Result<VfsStat> {
        let _t = self.timer("op_statfs");
        debug!("statfs");
        Ok(self.meta.statvfs())
    }

    pub fn get_inode_info(&self, ino: u64) -> Result<serde_json::Value> {
        self.meta.get_inode_info(ino)
    }

    fn xattr_value(&self, ino: u64, name: &str) -> Result<Option<(Vec<u8>, usize)>> {
        let root = ino == crate::metadata::INODE_OFFSET;

        if root && name == PID_XATTR {
            let value = std::process::id().to_string().into_bytes();
            return Ok(Some((value, 0)));
        }

        if root && name == PERFMON_XATTR {
            let mut text = match &self.perfmon {
                Some(mon) => mon.summarize(),
                None => "performance monitor is disabled\n".to_string(),
            };
            let stats = self.cache.stats();
            text.push_str(&format!(
                "cache: hits={} misses={} decompressions={} evictions={} \
                 tidy_evictions={} budget_overruns={} bytes={} blocks={}\n",
                stats.hits,
                stats.misses,
                stats.decompressions,
                stats.evictions,
                stats.tidy_evictions,
                stats.budget_overruns,
                stats.bytes_cached,
                stats.blocks_cached,
            ));
            return Ok(Some((text.into_bytes(), PERFMON_PROBE_SLACK)));
        }

        if name == INODEINFO_XATTR {
            let info = self.get_inode_info(ino)?;
            let mut value = serde_json::to_vec_pretty(&info)
                .map_err(|e| Error::CorruptImage(format!("inode info encode: {e}")))?;
            value.push(b'\n');
            return Ok(Some((value, 0)));
        }

        Ok(None)
    }

    /// getxattr with the buffer probe protocol: `size == 0` asks for the
    /// required length, a too-small buffer is Range.
    pub fn getxattr(&self, ino: u64, name: &str, size: usize) -> Result<XattrReply> {
        let _t = self.timer("op_getxattr");
        debug!(ino, name, size, "getxattr");

        let Some((value, probe_slack)) = self.xattr_value(ino, name)? else {
            return Err(Error::NoAttr.into());
        };

        if size == 0 {
            return Ok(XattrReply::Size(value.len() + probe_slack));
        }
        if size >= value.len() {
            return Ok(XattrReply::Data(value));
        }
        Err(Error::Range.into())
    }

    pub fn listxattr(&self, ino: u64, size: usize) -> Result<XattrReply> {
        let _t = self.timer("op_listxattr");
        debug!(ino, size, "listxattr");

        // Verify the inode exists before advertising anything.
        self.meta.getattr(ino)?;

        let mut list = Vec::new();
        if ino == crate::metadata::INODE_OFFSET {
            list.extend_from_slice(PID_XATTR.as_bytes());
            list.push(0);
            list.extend_from_slice(PERFMON_XATTR.as_bytes());
            list.push(0);
        }
        list.extend_from_slice(INODEINFO_XATTR.as_bytes());
        list.push(0);

        if size == 0 {
            return Ok(XattrReply::Size(list.len()));
        }
        if size >= list.len() {
            return Ok(XattrReply::Data(list));
        }
        Err(Error::Range.into())
    }

    /// Tear down the cache (cancels waiters, joins workers and the tidy
    /// thread). Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }

    /// The mapped image backing this mount.
    pub fn image(&self) -> &ImageReader {
        &self.image
    }
}

impl Drop for DwarFs {
    fn drop(&mut self) {
        self.shutdown();
    }
}
