//! Synthetic slab image
//!
//! A tiny EROFS image exposing one slab as a single file `slab`, whose chunk
//! indexes map 1:1 onto the slab device. Mounting it lets tools read a slab's
//! raw contents through the filesystem. The image is generated on demand; it is
//! never stored.

use super::format::{
    inode_format, volume_name, ChunkIndex, CompactInode, DeviceSlot, Dirent, ExtendedInode,
    SuperBlock, CHUNK_FORMAT_INDEXES, CHUNK_INDEX_SIZE, DEVICE_SLOT_SIZE, DEVT_OFFSET,
    DEVT_SLOT_OFF, DIRENT_SIZE, EXTENDED_INODE_SIZE, FEATURE_INCOMPAT_CHUNKED_FILE,
    FEATURE_INCOMPAT_DEVICE_TABLE, FT_DIR, FT_REG_FILE, INODE_SLOT_SHIFT, LAYOUT_CHUNK_BASED,
    LAYOUT_FLAT_INLINE, SUPERBLOCK_SIZE, SUPER_OFFSET, S_IFDIR, S_IFREG,
};
use crate::error::DaemonError;
use crate::slab::{slab_capacity_blocks, slab_tag};
use crate::types::{BlockShift, SlabId};

/// Target number of chunk indexes for the slab file.
const SLAB_IMAGE_CHUNKS: u32 = 4096;
pub const SLAB_FILE_NAME: &str = "slab";

const ROOT_NID: u64 = 0;
const FILE_NID: u64 = 3;

pub struct SlabImage {
    slab_id: SlabId,
    bytes: Vec<u8>,
}

impl SlabImage {
    /// Image for slab `slab_id` at its standard tag and capacity.
    pub fn new(slab_id: SlabId, block_shift: BlockShift) -> Result<Self, DaemonError> {
        Self::build(
            slab_id,
            block_shift,
            &slab_tag(slab_id),
            slab_capacity_blocks(block_shift) as u32,
        )
    }

    /// Build the image for a slab device `tag` of `slab_blocks` blocks.
    pub fn build(slab_id: SlabId, block_shift: BlockShift, tag: &str, slab_blocks: u32) -> Result<Self, DaemonError> {
        let bs = block_shift.size();
        let chunk_blocks = (slab_blocks / SLAB_IMAGE_CHUNKS).max(1);
        if !chunk_blocks.is_power_of_two() {
            return Err(DaemonError::InvalidRequest(format!(
                "slab of {} blocks cannot be chunked evenly",
                slab_blocks
            )));
        }
        let chunk_rel_bits = chunk_blocks.trailing_zeros();
        let count = slab_blocks.div_ceil(chunk_blocks) as usize;
        let meta_base = bs.max(4096);

        // root directory: ".", "..", "slab", inline
        let names = [".", "..", SLAB_FILE_NAME];
        let nids = [ROOT_NID, ROOT_NID, FILE_NID];
        let types = [FT_DIR, FT_DIR, FT_REG_FILE];
        let mut dir = Vec::new();
        let mut nameoff = names.len() * DIRENT_SIZE;
        for i in 0..names.len() {
            dir.extend_from_slice(
                &Dirent {
                    nid: nids[i],
                    nameoff: nameoff as u16,
                    file_type: types[i],
                }
                .encode(),
            );
            nameoff += names[i].len();
        }
        for name in names {
            dir.extend_from_slice(name.as_bytes());
        }
        let root = CompactInode {
            format: inode_format(LAYOUT_FLAT_INLINE),
            mode: S_IFDIR | 0o555,
            nlink: 2,
            size: dir.len() as u32,
            i_u: 0,
            ino: 1,
        };
        let file = ExtendedInode {
            format: inode_format(LAYOUT_CHUNK_BASED),
            mode: S_IFREG | 0o444,
            size: (slab_blocks as u64) << block_shift.0,
            i_u: chunk_rel_bits | CHUNK_FORMAT_INDEXES,
            ino: 2,
            nlink: 1,
        };

        let file_at = (meta_base + (FILE_NID << INODE_SLOT_SHIFT)) as usize;
        let index_at = file_at + EXTENDED_INODE_SIZE;
        let meta_end = (index_at + count * CHUNK_INDEX_SIZE) as u64;
        let total = block_shift.roundup(meta_end);

        let mut uuid = [0u8; 16];
        uuid[..8].copy_from_slice(b"cfs-slab");
        uuid[8..10].copy_from_slice(&slab_id.to_be_bytes());
        let sb = SuperBlock {
            blkszbits: block_shift.0 as u8,
            root_nid: ROOT_NID as u16,
            inos: 2,
            blocks: (total >> block_shift.0) as u32,
            meta_blkaddr: (meta_base >> block_shift.0) as u32,
            uuid,
            volume_name: volume_name(tag),
            feature_incompat: FEATURE_INCOMPAT_CHUNKED_FILE | FEATURE_INCOMPAT_DEVICE_TABLE,
            extra_devices: 1,
            devt_slotoff: DEVT_SLOT_OFF,
            ..Default::default()
        };
        let slot = DeviceSlot {
            tag: tag.to_string(),
            blocks: slab_blocks,
            mapped_blkaddr: 0,
        };

        let mut bytes = vec![0u8; total as usize];
        bytes[SUPER_OFFSET..SUPER_OFFSET + SUPERBLOCK_SIZE].copy_from_slice(&sb.encode());
        bytes[DEVT_OFFSET..DEVT_OFFSET + DEVICE_SLOT_SIZE].copy_from_slice(&slot.encode()?);
        let root_at = meta_base as usize;
        bytes[root_at..root_at + 32].copy_from_slice(&root.encode());
        bytes[root_at + 32..root_at + 32 + dir.len()].copy_from_slice(&dir);
        bytes[file_at..index_at].copy_from_slice(&file.encode());
        for i in 0..count {
            let idx = ChunkIndex {
                device_id: 1,
                blkaddr: (i as u32) << chunk_rel_bits,
            };
            let at = index_at + i * CHUNK_INDEX_SIZE;
            bytes[at..at + CHUNK_INDEX_SIZE].copy_from_slice(&idx.encode());
        }
        Ok(Self { slab_id, bytes })
    }

    pub fn slab_id(&self) -> SlabId {
        self.slab_id
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Bytes at `[off, off+len)`, clamped to the image end.
    pub fn read_at(&self, off: u64, len: u64) -> Result<&[u8], DaemonError> {
        if off >= self.size() {
            return Err(DaemonError::InvalidRequest(format!(
                "read at {} beyond slab image of {} bytes",
                off,
                self.size()
            )));
        }
        let end = off.saturating_add(len).min(self.size());
        Ok(&self.bytes[off as usize..end as usize])
    }
}
