//! Random-access view over the packed metadata section.
//!
//! The metadata payload is decoded once at mount into packed arrays
//! (inode table, directory table, sorted directory entries, name and
//! symlink tables, chunk table) and retained read-only. Inode numbers are
//! range-classified: directories first (0 is the root), then symlinks,
//! then regular files. The driver adds `inode_offset` so the host's root
//! id 1 maps to metadata inode 0.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

/// Inode number offset expected by the host protocol (root id is 1).
pub const INODE_OFFSET: u64 = 1;

#[derive(Debug, Clone, Deserialize)]
struct RawInode {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    #[serde(default)]
    atime: Option<u64>,
    #[serde(default)]
    ctime: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawDirectory {
    first_entry: u32,
    parent_entry: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawDirEntry {
    name_index: u32,
    inode: u32,
}

/// One contiguous slice of a block forming part of a file's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Chunk {
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    block_size: u32,
    total_size: u64,
    #[serde(default)]
    timestamp_base: u64,
    inodes: Vec<RawInode>,
    directories: Vec<RawDirectory>,
    dir_entries: Vec<RawDirEntry>,
    names: Vec<String>,
    #[serde(default)]
    symlink_table: Vec<u32>,
    #[serde(default)]
    symlinks: Vec<String>,
    chunk_table: Vec<u32>,
    #[serde(default)]
    chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Symlink,
    Regular,
}

/// Attributes of one inode, host-numbered.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ino: u64,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
    pub blksize: u32,
}

/// Filesystem-level statistics for statvfs.
#[derive(Debug, Clone, Copy)]
pub struct VfsStat {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub files: u64,
    pub namemax: u64,
    pub readonly: bool,
}

/// Open-directory handle: the resolved entry range of one directory.
#[derive(Debug, Clone, Copy)]
pub struct DirHandle {
    inode: u32,
    first: u32,
    end: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataOptions {
    pub enable_nlink: bool,
    pub readonly: bool,
    /// statvfs block size; 0 selects the image's own block size.
    pub block_size: usize,
}

#[derive(Debug)]
pub struct MetadataView {
    meta: RawMetadata,
    opts: MetadataOptions,
    /// First symlink inode; directories occupy `0..symlink_start`.
    symlink_start: u32,
    /// First regular-file inode.
    file_start: u32,
    /// Per-file byte sizes (sum of chunk sizes), indexed by file index.
    file_sizes: Vec<u64>,
    /// Synthesized hardlink counts, present with `enable_nlink`.
    nlink: Option<Vec<u32>>,
}

impl MetadataView {
    /// Decode and validate the metadata payload.
    pub fn parse(payload: &[u8], opts: MetadataOptions) -> Result<Self> {
        let meta: RawMetadata = serde_json::from_slice(payload)
            .map_err(|e| Error::CorruptImage(format!("metadata decode: {e}")))?;

        let view = Self::validate(meta, opts)?;
        debug!(
            inodes = view.meta.inodes.len(),
            directories = view.symlink_start,
            symlinks = view.file_start - view.symlink_start,
            files = view.file_sizes.len(),
            "metadata parsed"
        );
        Ok(view)
    }

    fn validate(meta: RawMetadata, opts: MetadataOptions) -> Result<Self> {
        fn corrupt(msg: impl Into<String>) -> anyhow::Error {
            Error::CorruptImage(msg.into()).into()
        }

        if meta.directories.len() < 2 {
            return Err(corrupt("missing root directory"));
        }
        if meta.block_size == 0 || !meta.block_size.is_power_of_two() {
            return Err(corrupt("invalid block size"));
        }
        if meta.chunk_table.is_empty() {
            return Err(corrupt("missing chunk table sentinel"));
        }

        let dir_count = meta.directories.len() - 1;
        let symlink_count = meta.symlink_table.len();
        let file_count = meta.chunk_table.len() - 1;
        let inode_count = meta.inodes.len();

        if dir_count + symlink_count + file_count != inode_count {
            return Err(corrupt(format!(
                "inode table length {inode_count} does not match {dir_count} directories + \
                 {symlink_count} symlinks + {file_count} files"
            )));
        }

        let entry_count = meta.dir_entries.len() as u32;
        if meta.directories[0].parent_entry != 0 {
            return Err(corrupt("root parent entry must be 0"));
        }
        for (i, w) in meta.directories.windows(2).enumerate() {
            if w[0].first_entry > w[1].first_entry {
                return Err(corrupt(format!("directory {i} entry range not monotonic")));
            }
            if w[0].parent_entry > entry_count {
                return Err(corrupt(format!("directory {i} parent entry out of range")));
            }
        }
        if meta.directories[dir_count].first_entry != entry_count {
            return Err(corrupt("directory sentinel does not cover all entries"));
        }

        let name_count = meta.names.len() as u32;
        for (i, ent) in meta.dir_entries.iter().enumerate() {
            if ent.inode as usize >= inode_count {
                return Err(corrupt(format!("entry {i} references bad inode")));
            }
            if ent.name_index >= name_count {
                return Err(corrupt(format!("entry {i} references bad name")));
            }
        }

        // Entries must be name-sorted per directory for binary search.
        for d in 0..dir_count {
            let range =
                meta.directories[d].first_entry as usize..meta.directories[d + 1].first_entry as usize;
            let entries = &meta.dir_entries[range];
            if !entries
                .windows(2)
                .all(|w| meta.names[w[0].name_index as usize] < meta.names[w[1].name_index as usize])
            {
                return Err(corrupt(format!(
                    "directory {d} entries are not sorted by name"
                )));
            }
        }

        let chunk_count = meta.chunks.len() as u32;
        for (i, w) in meta.chunk_table.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(corrupt(format!("chunk table not monotonic at file {i}")));
            }
            if w[1] > chunk_count {
                return Err(corrupt(format!("chunk table out of range at file {i}")));
            }
        }
        for (i, c) in meta.chunks.iter().enumerate() {
            let end = c.offset.checked_add(c.size);
            if end.is_none() || end.unwrap() > meta.block_size {
                return Err(corrupt(format!("chunk {i} exceeds block size")));
            }
        }

        let symlink_target_count = meta.symlinks.len() as u32;
        for (i, &t) in meta.symlink_table.iter().enumerate() {
            if t >= symlink_target_count {
                return Err(corrupt(format!("symlink {i} references bad target")));
            }
        }

        let symlink_start = dir_count as u32;
        let file_start = symlink_start + symlink_count as u32;

        // Mode bits must agree with the range classification.
        for (i, ino) in meta.inodes.iter().enumerate() {
            let fmt = ino.mode & (libc::S_IFMT as u32);
            let expected = if (i as u32) < symlink_start {
                libc::S_IFDIR as u32
            } else if (i as u32) < file_start {
                libc::S_IFLNK as u32
            } else {
                libc::S_IFREG as u32
            };
            if fmt != expected {
                return Err(corrupt(format!("inode {i} mode disagrees with its kind")));
            }
        }

        let file_sizes: Vec<u64> = (0..file_count)
            .map(|f| {
                let range = meta.chunk_table[f] as usize..meta.chunk_table[f + 1] as usize;
                meta.chunks[range].iter().map(|c| u64::from(c.size)).sum()
            })
            .collect();

        let nlink = opts.enable_nlink.then(|| {
            let mut counts = vec![0u32; inode_count];
            for ent in &meta.dir_entries {
                counts[ent.inode as usize] += 1;
            }
            // Directories follow the POSIX convention: self + dot entry
            // plus one dotdot per child directory.
            for d in 0..dir_count {
                let range =
                    meta.directories[d].first_entry as usize..meta.directories[d + 1].first_entry as usize;
                let subdirs = meta.dir_entries[range]
                    .iter()
                    .filter(|e| e.inode < symlink_start)
                    .count() as u32;
                counts[d] = 2 + subdirs;
            }
            counts[0] = counts[0].max(2);
            counts
        });

        Ok(Self {
            meta,
            opts,
            symlink_start,
            file_start,
            file_sizes,
            nlink,
        })
    }

    pub fn inode_count(&self) -> u64 {
        self.meta.inodes.len() as u64
    }

    pub fn block_size(&self) -> u32 {
        self.meta.block_size
    }

    pub fn total_size(&self) -> u64 {
        self.meta.total_size
    }

    pub fn has_symlinks(&self) -> bool {
        self.symlink_start != self.file_start
    }

    fn raw(&self, ino: u64) -> Result<u32> {
        let raw = ino
            .checked_sub(INODE_OFFSET)
            .ok_or(Error::NotFound)?;
        if raw >= self.meta.inodes.len() as u64 {
            return Err(Error::NotFound.into());
        }
        Ok(raw as u32)
    }

    fn kind_of(&self, raw: u32) -> FileKind {
        if raw < self.symlink_start {
            FileKind::Directory
        } else if raw < self.file_start {
            FileKind::Symlink
        } else {
            FileKind::Regular
        }
    }

    fn entry_range(&self, dir_raw: u32) -> std::ops::Range<usize> {
        let d = dir_raw as usize;
        self.meta.directories[d].first_entry as usize
            ..self.meta.directories[d + 1].first_entry as usize
    }

    fn entry_name(&self, ent: &RawDirEntry) -> &str {
        &self.meta.names[ent.name_index as usize]
    }

    /// Look up `name` in `parent`, O(log n) over the sorted entry range.
    pub fn find(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        let parent_raw = self.raw(parent)?;
        if self.kind_of(parent_raw) != FileKind::Directory {
            return Err(Error::NotDir.into());
        }

        let range = self.entry_range(parent_raw);
        let entries = &self.meta.dir_entries[range];
        let found = entries
            .binary_search_by(|ent| self.entry_name(ent).cmp(name))
            .ok()
            .map(|i| u64::from(entries[i].inode) + INODE_OFFSET);
        Ok(found)
    }

    /// Resolve an absolute or root-relative path by walking components.
    pub fn find_path(&self, path: &str) -> Result<Option<u64>> {
        let mut ino = INODE_OFFSET;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            match self.find(ino, comp)? {
                Some(next) => ino = next,
                None => return Ok(None),
            }
        }
        Ok(Some(ino))
    }

    pub fn getattr(&self, ino: u64) -> Result<FileStat> {
        let raw = self.raw(ino)?;
        let data = &self.meta.inodes[raw as usize];
        let kind = self.kind_of(raw);

        let size = match kind {
            FileKind::Directory => 0,
            FileKind::Symlink => self.symlink_target(raw).len() as u64,
            FileKind::Regular => self.file_sizes[(raw - self.file_start) as usize],
        };

        let nlink = match &self.nlink {
            Some(counts) => counts[raw as usize],
            None => match kind {
                FileKind::Directory => 2,
                _ => 1,
            },
        };

        let base = self.meta.timestamp_base;
        Ok(FileStat {
            ino,
            kind,
            mode: data.mode,
            uid: data.uid,
            gid: data.gid,
            nlink,
            size,
            mtime: base + data.mtime,
            atime: base + data.atime.unwrap_or(data.mtime),
            ctime: base + data.ctime.unwrap_or(data.mtime),
            blksize: self.meta.block_size,
        })
    }

    /// POSIX access check: root bypass, then owner, group, other bits.
    pub fn access(&self, ino: u64, mode: i32, uid: u32, gid: u32) -> Result<()> {
        let raw = self.raw(ino)?;
        if uid == 0 {
            return Ok(());
        }

        let data = &self.meta.inodes[raw as usize];
        let perm = data.mode;
        let granted = if uid == data.uid {
            (perm >> 6) & 0o7
        } else if gid == data.gid {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };

        if (mode as u32) & !granted & 0o7 != 0 {
            return Err(Error::AccessDenied.into());
        }
        Ok(())
    }

    fn symlink_target(&self, raw: u32) -> &str {
        let idx = self.meta.symlink_table[(raw - self.symlink_start) as usize];
        &self.meta.symlinks[idx as usize]
    }

    pub fn readlink(&self, ino: u64) -> Result<String> {
        let raw = self.raw(ino)?;
        if self.kind_of(raw) != FileKind::Symlink {
            return Err(Error::NotSymlink.into());
        }
        Ok(self.symlink_target(raw).to_string())
    }

    pub fn opendir(&self, ino: u64) -> Result<DirHandle> {
        let raw = self.raw(ino)?;
        if self.kind_of(raw) != FileKind::Directory {
            return Err(Error::NotDir.into());
        }
        let range = self.entry_range(raw);
        Ok(DirHandle {
            inode: raw,
            first: range.start as u32,
            end: range.end as u32,
        })
    }

    pub fn dirsize(&self, handle: &DirHandle) -> usize {
        (handle.end - handle.first) as usize
    }

    /// Entry at `offset` in packed order; the same offset names the same
    /// entry for the life of the mount.
    pub fn readdir(&self, handle: &DirHandle, offset: usize) -> Option<(u64, String)> {
        let idx = handle.first as usize + offset;
        if idx >= handle.end as usize {
            return None;
        }
        let ent = &self.meta.dir_entries[idx];
        Some((
            u64::from(ent.inode) + INODE_OFFSET,
            self.entry_name(ent).to_string(),
        ))
    }

    /// The host inode of the directory's parent (itself for the root).
    pub fn parent(&self, ino: u64) -> Result<u64> {
        let raw = self.raw(ino)?;
        if self.kind_of(raw) != FileKind::Directory {
            return Err(Error::NotDir.into());
        }
        if raw == 0 {
            return Ok(INODE_OFFSET);
        }
        let parent_entry = self.meta.directories[raw as usize].parent_entry as usize;
        // parent_entry points at this directory's entry in its parent;
        // recover the parent by locating the directory owning that entry.
        let owner = self
            .meta
            .directories
            .partition_point(|d| d.first_entry as usize <= parent_entry)
            .saturating_sub(1);
        Ok(owner as u64 + INODE_OFFSET)
    }

    pub fn statvfs(&self) -> VfsStat {
        let bsize = if self.opts.block_size != 0 {
            self.opts.block_size as u64
        } else {
            u64::from(self.meta.block_size)
        };
        VfsStat {
            bsize,
            frsize: bsize,
            blocks: self.meta.total_size.div_ceil(bsize),
            files: self.inode_count(),
            namemax: 255,
            readonly: self.opts.readonly,
        }
    }

    /// Ordered chunk list of a regular file.
    pub fn chunks(&self, ino: u64) -> Result<&[Chunk]> {
        let raw = self.raw(ino)?;
        match self.kind_of(raw) {
            FileKind::Directory => Err(Error::IsDir.into()),
            FileKind::Symlink => Err(Error::NotSupported.into()),
            FileKind::Regular => {
                let f = (raw - self.file_start) as usize;
                let range =
                    self.meta.chunk_table[f] as usize..self.meta.chunk_table[f + 1] as usize;
                Ok(&self.meta.chunks[range])
            }
        }
    }

    pub fn file_size(&self, ino: u64) -> Result<u64> {
        Ok(self.getattr(ino)?.size)
    }

    /// Diagnostic JSON for the inodeinfo xattr; stable enough to parse.
    pub fn get_inode_info(&self, ino: u64) -> Result<serde_json::Value> {
        let raw = self.raw(ino)?;
        let st = self.getattr(ino)?;
        let kind = match st.kind {
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
            FileKind::Regular => "file",
        };

        let mut info = json!({
            "inode": ino,
            "type": kind,
            "mode_octal": format!("{:o}", st.mode),
            "uid": st.uid,
            "gid": st.gid,
            "size": st.size,
        });

        match st.kind {
            FileKind::Regular => {
                let chunks: Vec<serde_json::Value> = self
                    .chunks(ino)?
                    .iter()
                    .map(|c| json!({"block": c.block, "offset": c.offset, "size": c.size}))
                    .collect();
                info["chunks"] = serde_json::Value::Array(chunks);
            }
            FileKind::Symlink => {
                info["target"] = json!(self.symlink_target(raw));
            }
            FileKind::Directory => {
                let handle = self.opendir(ino)?;
                info["entries"] = json!(self.dirsize(&handle));
            }
        }

        Ok(info)
    }
}
