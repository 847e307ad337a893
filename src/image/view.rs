//! Read-side view of a built image: resolve paths, list directories and read
//! back flat file data or chunk indexes.

use super::format::{
    decode_dir_block, decode_inode, ChunkIndex, DirEntryInfo, InodeInfo, SuperBlock,
    CHUNK_FORMAT_BLKBITS_MASK, CHUNK_INDEX_SIZE, INODE_SLOT_SHIFT, LAYOUT_CHUNK_BASED,
    LAYOUT_FLAT_INLINE, LAYOUT_FLAT_PLAIN, S_IFDIR,
};
use crate::error::DaemonError;

pub struct ImageView<'a> {
    image: &'a [u8],
    sb: SuperBlock,
    meta_base: u64,
}

impl<'a> ImageView<'a> {
    pub fn new(image: &'a [u8]) -> Result<Self, DaemonError> {
        let sb = SuperBlock::decode(image)?;
        let meta_base = (sb.meta_blkaddr as u64) << sb.blkszbits;
        Ok(Self { image, sb, meta_base })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn meta_base(&self) -> u64 {
        self.meta_base
    }

    fn block_size(&self) -> u64 {
        1u64 << self.sb.blkszbits
    }

    fn slice(&self, at: u64, len: u64) -> Result<&'a [u8], DaemonError> {
        let end = at
            .checked_add(len)
            .filter(|end| *end <= self.image.len() as u64)
            .ok_or_else(|| DaemonError::Verification(format!("range {}+{} outside image", at, len)))?;
        Ok(&self.image[at as usize..end as usize])
    }

    pub fn inode(&self, nid: u64) -> Result<InodeInfo, DaemonError> {
        decode_inode(self.image, self.meta_base, nid)
    }

    fn tail_offset(&self, nid: u64, info: &InodeInfo) -> u64 {
        self.meta_base + (nid << INODE_SLOT_SHIFT) + info.inode_size() as u64
    }

    /// Contents of a flat (plain or inline) inode.
    pub fn read_file(&self, nid: u64) -> Result<Vec<u8>, DaemonError> {
        let info = self.inode(nid)?;
        let bs = self.block_size();
        match info.layout {
            LAYOUT_FLAT_PLAIN => {
                let at = (info.i_u as u64) << self.sb.blkszbits;
                Ok(self.slice(at, info.size)?.to_vec())
            }
            LAYOUT_FLAT_INLINE => {
                let tail = info.size % bs;
                let full = info.size - tail;
                let mut out = Vec::with_capacity(info.size as usize);
                if full > 0 {
                    let at = (info.i_u as u64) << self.sb.blkszbits;
                    out.extend_from_slice(self.slice(at, full)?);
                }
                out.extend_from_slice(self.slice(self.tail_offset(nid, &info), tail)?);
                Ok(out)
            }
            other => Err(DaemonError::InvalidRequest(format!(
                "nid {} has layout {}, not flat",
                nid, other
            ))),
        }
    }

    pub fn read_dir(&self, nid: u64) -> Result<Vec<DirEntryInfo>, DaemonError> {
        let info = self.inode(nid)?;
        if info.mode & S_IFDIR != S_IFDIR {
            return Err(DaemonError::InvalidRequest(format!("nid {} is not a directory", nid)));
        }
        let data = self.read_file(nid)?;
        let mut out = Vec::new();
        for block in data.chunks(self.block_size() as usize) {
            out.extend(decode_dir_block(block)?);
        }
        Ok(out)
    }

    pub fn chunk_indexes(&self, nid: u64) -> Result<Vec<ChunkIndex>, DaemonError> {
        let info = self.inode(nid)?;
        if info.layout != LAYOUT_CHUNK_BASED {
            return Err(DaemonError::InvalidRequest(format!("nid {} is not chunk based", nid)));
        }
        let chunk_bits = self.sb.blkszbits as u32 + (info.i_u & CHUNK_FORMAT_BLKBITS_MASK);
        let count = info.size.div_ceil(1u64 << chunk_bits);
        let raw = self.slice(self.tail_offset(nid, &info), count * CHUNK_INDEX_SIZE as u64)?;
        raw.chunks(CHUNK_INDEX_SIZE).map(ChunkIndex::decode).collect()
    }

    /// Resolve an absolute path to a nid.
    pub fn lookup(&self, path: &str) -> Result<u64, DaemonError> {
        let mut nid = self.sb.root_nid as u64;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            nid = self
                .read_dir(nid)?
                .into_iter()
                .find(|e| e.name == name)
                .map(|e| e.nid)
                .ok_or_else(|| DaemonError::NotFound(path.to_string()))?;
        }
        Ok(nid)
    }
}
