//! Shared test support: builds real filesystem images in memory.
//!
//! The builder packs a small tree into block and metadata sections with
//! real codecs and checksums, producing bytes the driver mounts exactly
//! like a packer-produced image.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;

use serde_json::json;
use xxhash_rust::xxh3::xxh3_64;

use dwarfs::cache::Codec;
use dwarfs::cli::options::MountOptions;
use dwarfs::fs::DwarFs;

pub const SECTION_VERSION: u8 = 2;
pub const KIND_BLOCK: u8 = 0;
pub const KIND_METADATA: u8 = 1;

#[derive(Debug, Clone)]
pub enum Entry {
    Dir(BTreeMap<String, Entry>),
    File { content: Vec<u8>, mode: u32 },
    Symlink(String),
}

pub fn dir(entries: Vec<(&str, Entry)>) -> Entry {
    Entry::Dir(
        entries
            .into_iter()
            .map(|(name, e)| (name.to_string(), e))
            .collect(),
    )
}

pub fn file(content: impl AsRef<[u8]>) -> Entry {
    Entry::File {
        content: content.as_ref().to_vec(),
        mode: 0o100644,
    }
}

pub fn file_with_mode(content: impl AsRef<[u8]>, mode: u32) -> Entry {
    Entry::File {
        content: content.as_ref().to_vec(),
        mode,
    }
}

pub fn symlink(target: &str) -> Entry {
    Entry::Symlink(target.to_string())
}

pub struct ImageBuilder {
    pub block_size: u32,
    pub codec: Codec,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            block_size: 4096,
            codec: Codec::Zstd,
            uid: 1000,
            gid: 1000,
            mtime: 1_600_000_000,
        }
    }
}

struct Packed {
    inodes: Vec<serde_json::Value>,
    directories: Vec<serde_json::Value>,
    dir_entries: Vec<serde_json::Value>,
    names: Vec<String>,
    symlink_table: Vec<u32>,
    symlinks: Vec<String>,
    chunk_table: Vec<u32>,
    chunks: Vec<serde_json::Value>,
    blocks: Vec<Vec<u8>>,
    total_size: u64,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Serialize the tree into image bytes: block sections in block-id
    /// order followed by the metadata section.
    pub fn build(&self, root: &Entry) -> Vec<u8> {
        let packed = self.pack(root);

        let metadata = json!({
            "block_size": self.block_size,
            "total_size": packed.total_size,
            "timestamp_base": 0,
            "inodes": packed.inodes,
            "directories": packed.directories,
            "dir_entries": packed.dir_entries,
            "names": packed.names,
            "symlink_table": packed.symlink_table,
            "symlinks": packed.symlinks,
            "chunk_table": packed.chunk_table,
            "chunks": packed.chunks,
        });

        let mut image = Vec::new();
        for block in &packed.blocks {
            write_section(&mut image, KIND_BLOCK, self.codec, block);
        }
        write_section(
            &mut image,
            KIND_METADATA,
            self.codec,
            &serde_json::to_vec(&metadata).unwrap(),
        );
        image
    }

    fn pack(&self, root: &Entry) -> Packed {
        // Pass 1: assign inode numbers, directories first (root = 0),
        // then symlinks, then regular files, in depth-first order.
        let mut dirs: Vec<&BTreeMap<String, Entry>> = Vec::new();
        let mut symlinks: Vec<&String> = Vec::new();
        let mut files: Vec<(&Vec<u8>, u32)> = Vec::new();

        fn walk<'a>(
            entry: &'a Entry,
            dirs: &mut Vec<&'a BTreeMap<String, Entry>>,
            symlinks: &mut Vec<&'a String>,
            files: &mut Vec<(&'a Vec<u8>, u32)>,
        ) {
            match entry {
                Entry::Dir(children) => {
                    dirs.push(children);
                    for child in children.values() {
                        walk(child, dirs, symlinks, files);
                    }
                }
                Entry::Symlink(target) => symlinks.push(target),
                Entry::File { content, mode } => files.push((content, *mode)),
            }
        }
        walk(root, &mut dirs, &mut symlinks, &mut files);

        let dir_count = dirs.len() as u32;
        let symlink_start = dir_count;
        let file_start = symlink_start + symlinks.len() as u32;

        // Pass 2: assign ids in the same walk order.
        #[derive(Clone, Copy)]
        struct Ids {
            next_dir: u32,
            next_symlink: u32,
            next_file: u32,
        }
        fn assign(entry: &Entry, ids: &mut Ids, out: &mut Vec<u32>) {
            match entry {
                Entry::Dir(children) => {
                    out.push(ids.next_dir);
                    ids.next_dir += 1;
                    for child in children.values() {
                        assign(child, ids, out);
                    }
                }
                Entry::Symlink(_) => {
                    out.push(ids.next_symlink);
                    ids.next_symlink += 1;
                }
                Entry::File { .. } => {
                    out.push(ids.next_file);
                    ids.next_file += 1;
                }
            }
        }
        let mut ids = Ids {
            next_dir: 0,
            next_symlink: symlink_start,
            next_file: file_start,
        };
        let mut id_order = Vec::new();
        assign(root, &mut ids, &mut id_order);

        // Pass 3: emit directory entries per directory in id order; the
        // walk order of ids matches `dirs` order, so recompute child ids
        // the same way while emitting entries.
        let mut names = Vec::new();
        let mut dir_entries = Vec::new();
        let mut directories = Vec::new();
        let mut parent_entries = vec![0u32; dirs.len()];

        // Rebuild child ids by walking again with a cursor over id_order.
        fn collect_children<'a>(
            entry: &'a Entry,
            cursor: &mut usize,
            id_order: &[u32],
            children_of: &mut Vec<Vec<(String, u32)>>,
        ) -> u32 {
            let my_id = id_order[*cursor];
            *cursor += 1;
            if let Entry::Dir(children) = entry {
                let mut list = Vec::new();
                for (name, child) in children {
                    let child_id = collect_children(child, cursor, id_order, children_of);
                    list.push((name.clone(), child_id));
                }
                children_of[my_id as usize] = list;
            }
            my_id
        }
        let mut children_of: Vec<Vec<(String, u32)>> = vec![Vec::new(); dirs.len()];
        let mut cursor = 0usize;
        collect_children(root, &mut cursor, &id_order, &mut children_of);

        let mut dir_entry_index: Vec<Option<u32>> = vec![None; dirs.len()];
        for d in 0..dirs.len() {
            directories.push(json!({
                "first_entry": dir_entries.len() as u32,
                "parent_entry": 0u32,
            }));
            for (name, child_id) in &children_of[d] {
                let name_index = names.len() as u32;
                names.push(name.clone());
                if (*child_id as usize) < dirs.len() {
                    dir_entry_index[*child_id as usize] = Some(dir_entries.len() as u32);
                }
                dir_entries.push(json!({
                    "name_index": name_index,
                    "inode": child_id,
                }));
            }
        }
        // Sentinel directory entry closing the table.
        directories.push(json!({
            "first_entry": dir_entries.len() as u32,
            "parent_entry": 0u32,
        }));

        for d in 1..dirs.len() {
            parent_entries[d] = dir_entry_index[d].expect("every non-root dir has an entry");
        }
        for (d, parent_entry) in parent_entries.iter().enumerate() {
            directories[d]["parent_entry"] = json!(parent_entry);
        }

        // Pass 4: inode table in id order and chunk packing for files.
        let mut inodes = vec![serde_json::Value::Null; (file_start as usize) + files.len()];
        for d in 0..dir_count {
            inodes[d as usize] = json!({
                "mode": 0o040755u32,
                "uid": self.uid, "gid": self.gid, "mtime": self.mtime,
            });
        }
        for (i, _target) in symlinks.iter().enumerate() {
            inodes[symlink_start as usize + i] = json!({
                "mode": 0o120777u32,
                "uid": self.uid, "gid": self.gid, "mtime": self.mtime,
            });
        }

        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let mut chunk_table = vec![0u32];
        let mut chunks = Vec::new();
        let mut total_size = 0u64;

        for (i, (content, mode)) in files.iter().enumerate() {
            inodes[file_start as usize + i] = json!({
                "mode": mode,
                "uid": self.uid, "gid": self.gid, "mtime": self.mtime,
            });
            total_size += content.len() as u64;

            let mut rest: &[u8] = content;
            while !rest.is_empty() {
                if blocks
                    .last()
                    .is_none_or(|b| b.len() >= self.block_size as usize)
                {
                    blocks.push(Vec::new());
                }
                let block_id = blocks.len() as u32 - 1;
                let block = blocks.last_mut().unwrap();
                let space = self.block_size as usize - block.len();
                let take = space.min(rest.len());
                chunks.push(json!({
                    "block": block_id,
                    "offset": block.len() as u32,
                    "size": take as u32,
                }));
                block.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            }
            chunk_table.push(chunks.len() as u32);
        }

        let symlink_table: Vec<u32> = (0..symlinks.len() as u32).collect();
        let symlink_targets: Vec<String> = symlinks.iter().map(|s| s.to_string()).collect();

        Packed {
            inodes,
            directories,
            dir_entries,
            names,
            symlink_table,
            symlinks: symlink_targets,
            chunk_table,
            chunks,
            blocks,
            total_size,
        }
    }
}

/// Compress `plain` with `codec` and append a complete section.
pub fn write_section(out: &mut Vec<u8>, kind: u8, codec: Codec, plain: &[u8]) {
    let payload = compress(codec, plain);
    write_raw_section(out, kind, codec.as_raw(), &payload, xxh3_64(&payload));
}

/// Append a section with caller-controlled codec id and checksum, for
/// corruption tests.
pub fn write_raw_section(out: &mut Vec<u8>, kind: u8, codec: u8, payload: &[u8], checksum: u64) {
    out.extend_from_slice(b"DWARFS");
    out.push(SECTION_VERSION);
    out.push(kind);
    out.push(codec);
    out.extend_from_slice(&[0u8; 7]);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(payload);
}

pub fn compress(codec: Codec, plain: &[u8]) -> Vec<u8> {
    match codec {
        Codec::Null => plain.to_vec(),
        Codec::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(plain).unwrap();
            enc.finish().unwrap()
        }
        Codec::Lz4 => lz4_flex::block::compress_prepend_size(plain),
        Codec::Zstd => zstd::stream::encode_all(plain, 3).unwrap(),
    }
}

/// Write image bytes to a temp file and bring the full driver stack up
/// over it, with worker threads started.
pub fn mount_image(image: &[u8], opts: MountOptions) -> (tempfile::TempDir, Arc<DwarFs>) {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("test.dwarfs");
    std::fs::write(&path, image).unwrap();
    let fs = Arc::new(DwarFs::open(&path, &opts).unwrap());
    fs.post_fork_init();
    (tmp, fs)
}

/// Convenience wrapper with default options.
pub fn mount_default(image: &[u8]) -> (tempfile::TempDir, Arc<DwarFs>) {
    mount_image(image, MountOptions::default())
}
