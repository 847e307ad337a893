//! EROFS image builder
//!
//! Turns a manifest into a complete EROFS image in memory:
//!
//! 1. Walk the entries creating inodes. Small files and symlinks keep their
//!    bytes, chunked files queue their chunks for one allocation batch.
//! 2. Sort and size directories, then pack every inode with its inline tail
//!    into the metadata area to assign nids.
//! 3. Render directory blocks now that nids are known, and lay out out-of-line
//!    data blocks after the metadata.
//! 4. Write the superblock, device table, metadata and data.

use super::format::{
    inode_format, volume_name, ChunkIndex, CompactInode, DeviceSlot, Dirent, SuperBlock,
    CHUNK_FORMAT_INDEXES, CHUNK_INDEX_SIZE, COMPACT_INODE_SIZE, DEVICE_SLOT_SIZE, DEVT_OFFSET,
    DEVT_SLOT_OFF, DIRENT_SIZE, FEATURE_INCOMPAT_CHUNKED_FILE, FEATURE_INCOMPAT_DEVICE_TABLE,
    FT_DIR, FT_REG_FILE, FT_SYMLINK, INODE_SLOT_SHIFT, INODE_SLOT_SIZE, LAYOUT_CHUNK_BASED,
    LAYOUT_FLAT_INLINE, LAYOUT_FLAT_PLAIN, NAME_MAX, SUPER_OFFSET, S_IFDIR, S_IFLNK, S_IFREG,
};
use crate::error::DaemonError;
use crate::manifest::{EntryKind, Manifest, ManifestEntry};
use crate::slab::SlabAllocator;
use crate::types::{BlockShift, Digest, GlobalParams, SlabId, SlabLoc};
use std::collections::HashMap;
use tracing::debug;

/// Start of the metadata area for block sizes up to 4 KiB.
const MIN_META_BASE: u64 = 4096;

/// What the builder needs from the chunk allocator.
pub trait ChunkAllocator: Send + Sync {
    fn verify_params(&self, digest_bytes: usize, block_size: u64, chunk_size: u64) -> Result<(), DaemonError>;

    /// Assign locations to a whole image's chunks at once, recording `owner`.
    fn allocate_batch(&self, block_counts: &[u32], digests: &[Digest], owner: &str) -> Result<Vec<SlabLoc>, DaemonError>;

    /// Device tag and size in blocks of a slab.
    fn slab_info(&self, slab_id: SlabId) -> (String, u32);
}

impl ChunkAllocator for SlabAllocator {
    fn verify_params(&self, digest_bytes: usize, block_size: u64, chunk_size: u64) -> Result<(), DaemonError> {
        SlabAllocator::verify_params(self, digest_bytes, block_size, chunk_size)
    }

    fn allocate_batch(&self, block_counts: &[u32], digests: &[Digest], owner: &str) -> Result<Vec<SlabLoc>, DaemonError> {
        SlabAllocator::allocate_batch(self, block_counts, digests, owner)
    }

    fn slab_info(&self, slab_id: SlabId) -> (String, u32) {
        SlabAllocator::slab_info(self, slab_id)
    }
}

/// Inode under construction.
struct Node {
    inode: CompactInode,
    /// Inline tail or chunk index array following the inode
    tail: Vec<u8>,
    nid: u64,
}

struct DirChild {
    name: String,
    inum: usize,
    file_type: u8,
}

struct Dir {
    inum: usize,
    children: Vec<DirChild>,
    /// Ranges into `children` per directory block, after sorting
    blocks: Vec<std::ops::Range<usize>>,
}

struct ChunkedFile {
    inum: usize,
    first: usize,
    count: usize,
}

fn invalid(path: &str, reason: &str) -> DaemonError {
    DaemonError::InvalidRequest(format!("{}: {}", path, reason))
}

/// Split "/a/b" into ("/a", "b"). The root has no parent.
fn split_path(path: &str) -> Result<Option<(&str, &str)>, DaemonError> {
    if path == "/" {
        return Ok(None);
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(invalid(path, "not a normalized absolute path"));
    }
    let (parent, name) = match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => return Err(invalid(path, "not absolute")),
    };
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(invalid(path, "bad file name"));
    }
    if name.len() > NAME_MAX {
        return Err(invalid(path, "file name too long"));
    }
    Ok(Some((parent, name)))
}

fn roundup_slot(n: u64) -> u64 {
    (n + INODE_SLOT_SIZE as u64 - 1) & !(INODE_SLOT_SIZE as u64 - 1)
}

pub struct ImageBuilder {
    block_shift: BlockShift,
    params: GlobalParams,
}

impl ImageBuilder {
    pub fn new(block_shift: BlockShift, params: GlobalParams) -> Self {
        Self { block_shift, params }
    }

    pub fn block_shift(&self) -> BlockShift {
        self.block_shift
    }

    /// Build an image for `manifest`, allocating its chunks under `owner`.
    pub fn build(&self, manifest: &Manifest, owner: &str, alloc: &dyn ChunkAllocator) -> Result<Vec<u8>, DaemonError> {
        let shift = self.block_shift;
        let bs = shift.size();
        let digest_bytes = self.params.digest_bytes();
        if self.params.chunk_shift < shift.0 {
            return Err(DaemonError::InvalidRequest(format!(
                "chunk shift {} below block shift {}",
                self.params.chunk_shift, shift.0
            )));
        }
        alloc.verify_params(digest_bytes, bs, self.params.chunk_size())?;

        let mut nodes: Vec<Node> = Vec::with_capacity(manifest.entries.len());
        let mut dirs: Vec<Dir> = Vec::new();
        let mut dir_by_path: HashMap<&str, usize> = HashMap::new();
        let mut file_data: Vec<(usize, &[u8])> = Vec::new();
        let mut chunked: Vec<ChunkedFile> = Vec::new();
        let mut block_counts: Vec<u32> = Vec::new();
        let mut digests: Vec<Digest> = Vec::new();

        // pass 1: inodes
        for (i, entry) in manifest.entries.iter().enumerate() {
            let inum = nodes.len();
            let split = split_path(&entry.path)?;
            let parent_dir = match (i, split) {
                (0, None) => None,
                (0, Some(_)) => return Err(invalid(&entry.path, "first entry must be the root")),
                (_, None) => return Err(invalid(&entry.path, "duplicate root")),
                (_, Some((parent, name))) => {
                    let d = *dir_by_path
                        .get(parent)
                        .ok_or_else(|| invalid(&entry.path, "parent is not a known directory"))?;
                    Some((d, name))
                }
            };
            if i == 0 && entry.kind != EntryKind::Directory {
                return Err(invalid(&entry.path, "root must be a directory"));
            }

            let mut node = Node {
                inode: CompactInode {
                    ino: inum as u32 + 1,
                    nlink: 1,
                    ..Default::default()
                },
                tail: Vec::new(),
                nid: 0,
            };
            let file_type = match entry.kind {
                EntryKind::Directory => {
                    let parent_inum = match parent_dir {
                        Some((d, _)) => dirs[d].inum,
                        None => inum,
                    };
                    node.inode.mode = S_IFDIR | 0o755;
                    node.inode.nlink = 2;
                    if parent_inum != inum {
                        nodes[parent_inum].inode.nlink += 1;
                    }
                    dir_by_path.insert(entry.path.as_str(), dirs.len());
                    dirs.push(Dir {
                        inum,
                        children: vec![
                            DirChild {
                                name: ".".to_string(),
                                inum,
                                file_type: FT_DIR,
                            },
                            DirChild {
                                name: "..".to_string(),
                                inum: parent_inum,
                                file_type: FT_DIR,
                            },
                        ],
                        blocks: Vec::new(),
                    });
                    FT_DIR
                }
                EntryKind::Regular if entry.is_chunked() => {
                    node.inode.mode = S_IFREG | if entry.executable { 0o755 } else { 0o644 };
                    node.inode.size = compact_size(entry)?;
                    let list = entry.digest_list(digest_bytes)?;
                    let chunk = self.params.chunk_size();
                    let expected = entry.size.div_ceil(chunk) as usize;
                    if list.len() != expected {
                        return Err(DaemonError::Verification(format!(
                            "{}: {} digests for {} bytes, expected {}",
                            entry.path,
                            list.len(),
                            entry.size,
                            expected
                        )));
                    }
                    for k in 0..list.len() as u64 {
                        let len = chunk.min(entry.size - k * chunk);
                        block_counts.push(shift.blocks(len) as u32);
                    }
                    chunked.push(ChunkedFile {
                        inum,
                        first: digests.len(),
                        count: list.len(),
                    });
                    digests.extend(list);
                    node.inode.format = inode_format(LAYOUT_CHUNK_BASED);
                    node.inode.i_u = (self.params.chunk_shift - shift.0) | CHUNK_FORMAT_INDEXES;
                    node.tail = vec![0u8; expected * CHUNK_INDEX_SIZE];
                    FT_REG_FILE
                }
                EntryKind::Regular | EntryKind::Symlink => {
                    if entry.inline_data.len() as u64 != entry.size {
                        return Err(DaemonError::Verification(format!(
                            "{}: inline data is {} bytes, size is {}",
                            entry.path,
                            entry.inline_data.len(),
                            entry.size
                        )));
                    }
                    node.inode.size = compact_size(entry)?;
                    let file_type = if entry.kind == EntryKind::Symlink {
                        node.inode.mode = S_IFLNK | 0o777;
                        FT_SYMLINK
                    } else {
                        node.inode.mode = S_IFREG | if entry.executable { 0o755 } else { 0o644 };
                        FT_REG_FILE
                    };
                    let data = entry.inline_data.as_slice();
                    let tail = shift.leftover(entry.size) as usize;
                    if tail == 0 || tail as u64 > bs - COMPACT_INODE_SIZE as u64 {
                        node.inode.format = inode_format(LAYOUT_FLAT_PLAIN);
                        if !data.is_empty() {
                            file_data.push((inum, data));
                        }
                    } else {
                        node.inode.format = inode_format(LAYOUT_FLAT_INLINE);
                        let full = data.len() - tail;
                        node.tail = data[full..].to_vec();
                        if full > 0 {
                            file_data.push((inum, &data[..full]));
                        }
                    }
                    file_type
                }
                EntryKind::Unsupported => {
                    return Err(invalid(&entry.path, "unsupported entry kind"));
                }
            };

            if let Some((d, name)) = parent_dir {
                dirs[d].children.push(DirChild {
                    name: name.to_string(),
                    inum,
                    file_type,
                });
            }
            nodes.push(node);
        }
        if nodes.is_empty() {
            return Err(DaemonError::InvalidRequest("empty manifest".to_string()));
        }

        // chunk locations for the whole image in one batch
        let mut max_slab: Option<SlabId> = None;
        if !digests.is_empty() {
            let locs = alloc.allocate_batch(&block_counts, &digests, owner)?;
            if locs.len() != digests.len() {
                return Err(DaemonError::Fault(format!(
                    "allocator returned {} locations for {} chunks",
                    locs.len(),
                    digests.len()
                )));
            }
            for file in &chunked {
                let tail = &mut nodes[file.inum].tail;
                for (k, loc) in locs[file.first..file.first + file.count].iter().enumerate() {
                    let device_id = loc.slab_id.checked_add(1).ok_or_else(|| {
                        DaemonError::Storage(crate::error::StorageError::Corrupt {
                            key: loc.to_string(),
                            reason: "slab id out of range".to_string(),
                        })
                    })?;
                    let idx = ChunkIndex {
                        device_id,
                        blkaddr: loc.addr,
                    };
                    tail[k * CHUNK_INDEX_SIZE..(k + 1) * CHUNK_INDEX_SIZE].copy_from_slice(&idx.encode());
                    max_slab = Some(max_slab.map_or(loc.slab_id, |m| m.max(loc.slab_id)));
                }
            }
        }

        // pass 2: size directories
        for dir in dirs.iter_mut() {
            dir.children.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
            if let Some(w) = dir.children.windows(2).find(|w| w[0].name == w[1].name) {
                return Err(DaemonError::InvalidRequest(format!(
                    "duplicate directory entry {:?}",
                    w[0].name
                )));
            }
            let mut start = 0;
            let mut used = 0u64;
            for (i, child) in dir.children.iter().enumerate() {
                let need = (DIRENT_SIZE + child.name.len()) as u64;
                if used + need > bs {
                    dir.blocks.push(start..i);
                    start = i;
                    used = 0;
                }
                used += need;
            }
            dir.blocks.push(start..dir.children.len());

            let size = (dir.blocks.len() as u64 - 1) * bs + used;
            let tail = shift.leftover(size);
            let node = &mut nodes[dir.inum];
            node.inode.size = size as u32;
            if tail == 0 || tail > bs - COMPACT_INODE_SIZE as u64 {
                node.inode.format = inode_format(LAYOUT_FLAT_PLAIN);
            } else {
                node.inode.format = inode_format(LAYOUT_FLAT_INLINE);
                node.tail = vec![0u8; tail as usize];
            }
        }

        // pack inodes and tails; a tail never crosses a block except for chunk
        // index arrays larger than a block, which start on a block boundary
        let mut p = 0u64;
        for node in nodes.iter_mut() {
            let need = COMPACT_INODE_SIZE as u64 + roundup_slot(node.tail.len() as u64);
            let used = shift.leftover(p);
            if used != 0 && need > bs - used {
                p += bs - used;
            }
            node.nid = p >> INODE_SLOT_SHIFT;
            p += need;
        }
        let meta_base = MIN_META_BASE.max(bs);
        let meta_size = shift.roundup(p);
        let mut data_end = meta_base + meta_size;

        // pass 3: render directories
        let mut out_of_line: Vec<(u64, Vec<u8>)> = Vec::new();
        for dir in &dirs {
            let mut rendered: Vec<Vec<u8>> = dir
                .blocks
                .iter()
                .map(|range| render_dir_block(&dir.children[range.clone()], &nodes))
                .collect();
            let inline = nodes[dir.inum].inode.layout() == LAYOUT_FLAT_INLINE;
            if inline {
                let tail = rendered.pop().unwrap_or_default();
                if tail.len() != nodes[dir.inum].tail.len() {
                    return Err(DaemonError::Fault(format!(
                        "directory tail is {} bytes, sized {}",
                        tail.len(),
                        nodes[dir.inum].tail.len()
                    )));
                }
                nodes[dir.inum].tail = tail;
            }
            if !rendered.is_empty() {
                nodes[dir.inum].inode.i_u = block_addr(shift, data_end)?;
                for block in rendered {
                    out_of_line.push((data_end, block));
                    data_end += bs;
                }
            }
        }
        for (inum, data) in &file_data {
            nodes[*inum].inode.i_u = block_addr(shift, data_end)?;
            out_of_line.push((data_end, data.to_vec()));
            data_end += shift.roundup(data.len() as u64);
        }
        block_addr(shift, data_end)?;

        // device table
        let mut slots = Vec::new();
        if let Some(max) = max_slab {
            for slab_id in 0..=max {
                let (tag, blocks) = alloc.slab_info(slab_id);
                slots.push(DeviceSlot {
                    tag,
                    blocks,
                    mapped_blkaddr: 0,
                });
            }
        }
        if DEVT_OFFSET + slots.len() * DEVICE_SLOT_SIZE > meta_base as usize {
            return Err(DaemonError::InvalidRequest(format!(
                "{} devices do not fit in the device table",
                slots.len()
            )));
        }

        let mut feature_incompat = 0;
        if !chunked.is_empty() {
            feature_incompat |= FEATURE_INCOMPAT_CHUNKED_FILE;
        }
        if !slots.is_empty() {
            feature_incompat |= FEATURE_INCOMPAT_DEVICE_TABLE;
        }
        let sb = SuperBlock {
            blkszbits: shift.0 as u8,
            root_nid: u16::try_from(nodes[0].nid)
                .map_err(|_| DaemonError::Fault("root nid out of range".to_string()))?,
            inos: nodes.len() as u64,
            blocks: block_addr(shift, data_end)?,
            meta_blkaddr: block_addr(shift, meta_base)?,
            uuid: uuid::Uuid::new_v4().into_bytes(),
            volume_name: volume_name(&format!("cfs-{}", owner)),
            feature_incompat,
            extra_devices: slots.len() as u16,
            devt_slotoff: if slots.is_empty() { 0 } else { DEVT_SLOT_OFF },
            ..Default::default()
        };

        // pass 4: write
        let mut image = vec![0u8; data_end as usize];
        image[SUPER_OFFSET..SUPER_OFFSET + super::format::SUPERBLOCK_SIZE].copy_from_slice(&sb.encode());
        for (i, slot) in slots.iter().enumerate() {
            let at = DEVT_OFFSET + i * DEVICE_SLOT_SIZE;
            image[at..at + DEVICE_SLOT_SIZE].copy_from_slice(&slot.encode()?);
        }
        for node in &nodes {
            let at = (meta_base + (node.nid << INODE_SLOT_SHIFT)) as usize;
            image[at..at + COMPACT_INODE_SIZE].copy_from_slice(&node.inode.encode());
            let t = at + COMPACT_INODE_SIZE;
            image[t..t + node.tail.len()].copy_from_slice(&node.tail);
        }
        for (at, data) in out_of_line {
            let at = at as usize;
            image[at..at + data.len()].copy_from_slice(&data);
        }

        debug!(
            owner = %owner,
            inodes = nodes.len(),
            chunks = digests.len(),
            bytes = image.len(),
            "Built image"
        );
        Ok(image)
    }
}

fn compact_size(entry: &ManifestEntry) -> Result<u32, DaemonError> {
    u32::try_from(entry.size).map_err(|_| invalid(&entry.path, "file too large for image"))
}

fn block_addr(shift: BlockShift, offset: u64) -> Result<u32, DaemonError> {
    u32::try_from(offset >> shift.0)
        .map_err(|_| DaemonError::InvalidRequest("image exceeds addressable blocks".to_string()))
}

fn render_dir_block(children: &[DirChild], nodes: &[Node]) -> Vec<u8> {
    let mut block = Vec::new();
    let mut nameoff = children.len() * DIRENT_SIZE;
    for child in children {
        let d = Dirent {
            nid: nodes[child.inum].nid,
            nameoff: nameoff as u16,
            file_type: child.file_type,
        };
        block.extend_from_slice(&d.encode());
        nameoff += child.name.len();
    }
    for child in children {
        block.extend_from_slice(child.name.as_bytes());
    }
    block
}
