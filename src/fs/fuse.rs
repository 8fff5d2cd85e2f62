//! FUSE adapter: maps `fuser::Filesystem` callbacks onto the `DwarFs`
//! facade.
//!
//! The adapter is inode-keyed (low-level style): callbacks receive inode
//! numbers and reply through fuser's typed reply objects. All error paths
//! go through the errno translation in `lib.rs`.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr,
    Request,
};
use tracing::{debug, error, warn};

use crate::errno_of;
use crate::fs::{DwarFs, XattrReply};
use crate::metadata::{FileKind, FileStat};
use crate::Result;

/// Attribute/entry cache TTL. Metadata is immutable for the life of the
/// mount, so the kernel may cache as long as it likes.
const TTL: Duration = Duration::from_secs(u32::MAX as u64);

fn kind_to_fuser(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Regular => FileType::RegularFile,
    }
}

fn stat_to_attr(st: &FileStat) -> FileAttr {
    FileAttr {
        ino: st.ino,
        size: st.size,
        blocks: st.size.div_ceil(512),
        atime: UNIX_EPOCH + Duration::from_secs(st.atime),
        mtime: UNIX_EPOCH + Duration::from_secs(st.mtime),
        ctime: UNIX_EPOCH + Duration::from_secs(st.ctime),
        crtime: UNIX_EPOCH + Duration::from_secs(st.ctime),
        kind: kind_to_fuser(st.kind),
        perm: (st.mode & 0o7777) as u16,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: 0,
        blksize: st.blksize,
        flags: 0,
    }
}

pub struct DwarFuse {
    fs: Arc<DwarFs>,
}

impl DwarFuse {
    pub fn new(fs: Arc<DwarFs>) -> Self {
        Self { fs }
    }

    fn utf8_name<'a>(&self, name: &'a OsStr) -> Option<&'a str> {
        // Metadata names are UTF-8; anything else cannot match.
        name.to_str()
    }
}

impl Filesystem for DwarFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        debug!("op_init");
        // Worker and tidy threads start here, after the driver has forked
        // into the background.
        self.fs.post_fork_init();
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("op_destroy");
        self.fs.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = self.utf8_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.fs.find(parent, name) {
            Ok(Some(ino)) => match self.fs.getattr(ino) {
                Ok(st) => reply.entry(&TTL, &stat_to_attr(&st), 1),
                Err(e) => reply.error(errno_of(&e)),
            },
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(st) => reply.attr(&TTL, &stat_to_attr(&st)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.fs.access(ino, mask, req.uid(), req.gid()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags) {
            Ok(fh) => {
                let open_flags = if self.fs.keep_file_cache() {
                    fuser::consts::FOPEN_KEEP_CACHE
                } else {
                    fuser::consts::FOPEN_DIRECT_IO
                };
                reply.opened(fh, open_flags);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as u64;
        // The scatter list pins the cached blocks until the reply buffer
        // has been flattened; fuser's reply takes one contiguous slice.
        match self.fs.readv(ino, size as usize, offset, fh) {
            Ok(slices) => {
                let total: usize = slices.iter().map(|s| s.len()).sum();
                let mut buf = Vec::with_capacity(total);
                for s in &slices {
                    buf.extend_from_slice(s.as_slice());
                }
                reply.data(&buf);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handle = match self.fs.opendir(ino) {
            Ok(h) => h,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };

        // Kernel offsets: 1 is ".", 2 is "..", real entry i sits at i + 3
        // so restarting from any returned offset resumes correctly.
        let mut next = offset;
        if next == 0 {
            if reply.add(ino, 1, FileType::Directory, ".") {
                reply.ok();
                return;
            }
            next = 1;
        }
        if next == 1 {
            let parent = self.fs.parent(ino).unwrap_or(ino);
            if reply.add(parent, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }
            next = 2;
        }

        let mut entry_off = (next - 2) as usize;
        while let Some((child, name)) = self.fs.readdir(&handle, entry_off) {
            let kind = match self.fs.getattr(child) {
                Ok(st) => kind_to_fuser(st.kind),
                Err(_) => FileType::RegularFile,
            };
            if reply.add(child, entry_off as i64 + 3, kind, name) {
                break;
            }
            entry_off += 1;
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statvfs() {
            Ok(st) => reply.statfs(
                st.blocks,
                0,
                0,
                st.files,
                0,
                st.bsize as u32,
                st.namemax as u32,
                st.frsize as u32,
            ),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = self.utf8_name(name) else {
            reply.error(crate::Error::NoAttr.errno());
            return;
        };

        match self.fs.getxattr(ino, name, size as usize) {
            Ok(XattrReply::Size(len)) => reply.size(len as u32),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(ino, size as usize) {
            Ok(XattrReply::Size(len)) => reply.size(len as u32),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(errno_of(&e)),
        }
    }
}

/// Handle to a running mount; callers invoke `unmount` to tear it down.
pub struct MountHandle {
    mountpoint: String,
    session: BackgroundSession,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl MountHandle {
    pub fn unmount(self) {
        self.session.join();
    }
}

/// Spawn a background FUSE session serving `fs` at `mountpoint`.
pub fn spawn(fs: Arc<DwarFs>, mountpoint: impl AsRef<Path>) -> Result<MountHandle> {
    let mountpoint = mountpoint.as_ref().to_string_lossy().to_string();
    let adapter = DwarFuse::new(fs);
    let options = [
        MountOption::FSName("dwarfs".into()),
        MountOption::RO,
        MountOption::NoAtime,
    ];

    match fuser::spawn_mount2(adapter, &mountpoint, &options) {
        Ok(session) => Ok(MountHandle {
            mountpoint,
            session,
        }),
        Err(e) => {
            check_fusermount();
            error!(mountpoint = %mountpoint, error = %e, "failed to mount");
            Err(e.into())
        }
    }
}

/// Hint at the missing FUSE helper when mounting fails.
fn check_fusermount() {
    let found = std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join("fusermount3").is_file())
    });
    if !found {
        warn!("could not find `fusermount3' in PATH");
        warn!("do you need to install the `fuse3' package?");
    }
}
