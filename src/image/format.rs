//! EROFS on-disk structures
//!
//! Little-endian encoders for the superblock, device slots, inodes, chunk
//! indexes and directory entries, plus the decoders the tests and the debug
//! surface use to read an image back.

use crate::error::DaemonError;

pub const EROFS_SUPER_MAGIC: u32 = 0xE0F5_E1E2;
pub const SUPER_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 128;
pub const DEVICE_SLOT_SIZE: usize = 128;
/// Device table starts right after the superblock.
pub const DEVT_OFFSET: usize = SUPER_OFFSET + SUPERBLOCK_SIZE;
pub const DEVT_SLOT_OFF: u16 = (DEVT_OFFSET / DEVICE_SLOT_SIZE) as u16;

pub const INODE_SLOT_SHIFT: u32 = 5;
pub const INODE_SLOT_SIZE: usize = 1 << INODE_SLOT_SHIFT;
pub const COMPACT_INODE_SIZE: usize = 32;
pub const EXTENDED_INODE_SIZE: usize = 64;
pub const DIRENT_SIZE: usize = 12;
pub const CHUNK_INDEX_SIZE: usize = 8;
pub const NAME_MAX: usize = 255;

pub const LAYOUT_FLAT_PLAIN: u16 = 0;
pub const LAYOUT_FLAT_INLINE: u16 = 2;
pub const LAYOUT_CHUNK_BASED: u16 = 4;
const LAYOUT_BIT: u16 = 1;
const VERSION_EXTENDED: u16 = 1;

/// Chunk-based `i_u`: low bits hold chunk_bits - block_bits.
pub const CHUNK_FORMAT_INDEXES: u32 = 0x20;
pub const CHUNK_FORMAT_BLKBITS_MASK: u32 = 0x1f;

pub const FEATURE_INCOMPAT_CHUNKED_FILE: u32 = 0x0000_0004;
pub const FEATURE_INCOMPAT_DEVICE_TABLE: u32 = 0x0000_0008;

pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

pub const S_IFREG: u16 = 0o100000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFLNK: u16 = 0o120000;

/// Data layout of an inode, stored in bits 1..3 of `i_format`.
pub fn inode_format(layout: u16) -> u16 {
    layout << LAYOUT_BIT
}

fn layout_of(format: u16) -> u16 {
    (format >> LAYOUT_BIT) & 0x7
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<(), DaemonError> {
    if buf.len() < len {
        return Err(DaemonError::Verification(format!(
            "{} truncated: {} < {} bytes",
            what,
            buf.len(),
            len
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperBlock {
    pub checksum: u32,
    pub blkszbits: u8,
    pub root_nid: u16,
    pub inos: u64,
    pub build_time: u64,
    pub blocks: u32,
    pub meta_blkaddr: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub feature_incompat: u32,
    pub extra_devices: u16,
    pub devt_slotoff: u16,
}

impl SuperBlock {
    fn encode_with(&self, checksum: u32) -> [u8; SUPERBLOCK_SIZE] {
        let mut b = [0u8; SUPERBLOCK_SIZE];
        b[0..4].copy_from_slice(&EROFS_SUPER_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&checksum.to_le_bytes());
        b[12] = self.blkszbits;
        b[14..16].copy_from_slice(&self.root_nid.to_le_bytes());
        b[16..24].copy_from_slice(&self.inos.to_le_bytes());
        b[24..32].copy_from_slice(&self.build_time.to_le_bytes());
        b[36..40].copy_from_slice(&self.blocks.to_le_bytes());
        b[40..44].copy_from_slice(&self.meta_blkaddr.to_le_bytes());
        b[48..64].copy_from_slice(&self.uuid);
        b[64..80].copy_from_slice(&self.volume_name);
        b[80..84].copy_from_slice(&self.feature_incompat.to_le_bytes());
        b[86..88].copy_from_slice(&self.extra_devices.to_le_bytes());
        b[88..90].copy_from_slice(&self.devt_slotoff.to_le_bytes());
        b
    }

    /// Encode with the checksum computed over the block with a zero checksum field.
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let checksum = crc32fast::hash(&self.encode_with(0));
        self.encode_with(checksum)
    }

    pub fn decode(image: &[u8]) -> Result<Self, DaemonError> {
        need(image, SUPER_OFFSET + SUPERBLOCK_SIZE, "superblock")?;
        let b = &image[SUPER_OFFSET..SUPER_OFFSET + SUPERBLOCK_SIZE];
        if get_u32(b, 0) != EROFS_SUPER_MAGIC {
            return Err(DaemonError::Verification("bad erofs magic".to_string()));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[48..64]);
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&b[64..80]);
        Ok(Self {
            checksum: get_u32(b, 4),
            blkszbits: b[12],
            root_nid: get_u16(b, 14),
            inos: get_u64(b, 16),
            build_time: get_u64(b, 24),
            blocks: get_u32(b, 36),
            meta_blkaddr: get_u32(b, 40),
            uuid,
            volume_name,
            feature_incompat: get_u32(b, 80),
            extra_devices: get_u16(b, 86),
            devt_slotoff: get_u16(b, 88),
        })
    }

    pub fn checksum_ok(&self) -> bool {
        crc32fast::hash(&self.encode_with(0)) == self.checksum
    }
}

/// Copy a name into a fixed 16-byte field, truncating.
pub fn volume_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = name.len().min(16);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub tag: String,
    pub blocks: u32,
    pub mapped_blkaddr: u32,
}

impl DeviceSlot {
    pub fn encode(&self) -> Result<[u8; DEVICE_SLOT_SIZE], DaemonError> {
        if self.tag.len() > 64 {
            return Err(DaemonError::InvalidRequest(format!(
                "device tag {:?} longer than 64 bytes",
                self.tag
            )));
        }
        let mut b = [0u8; DEVICE_SLOT_SIZE];
        b[..self.tag.len()].copy_from_slice(self.tag.as_bytes());
        b[64..68].copy_from_slice(&self.blocks.to_le_bytes());
        b[68..72].copy_from_slice(&self.mapped_blkaddr.to_le_bytes());
        Ok(b)
    }

    pub fn decode(b: &[u8]) -> Result<Self, DaemonError> {
        need(b, DEVICE_SLOT_SIZE, "device slot")?;
        let end = b[..64].iter().position(|&c| c == 0).unwrap_or(64);
        Ok(Self {
            tag: String::from_utf8_lossy(&b[..end]).into_owned(),
            blocks: get_u32(b, 64),
            mapped_blkaddr: get_u32(b, 68),
        })
    }
}

/// 32-byte inode. `size` is limited to u32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactInode {
    pub format: u16,
    pub mode: u16,
    pub nlink: u16,
    pub size: u32,
    pub i_u: u32,
    pub ino: u32,
}

impl CompactInode {
    pub fn encode(&self) -> [u8; COMPACT_INODE_SIZE] {
        let mut b = [0u8; COMPACT_INODE_SIZE];
        b[0..2].copy_from_slice(&self.format.to_le_bytes());
        b[4..6].copy_from_slice(&self.mode.to_le_bytes());
        b[6..8].copy_from_slice(&self.nlink.to_le_bytes());
        b[8..12].copy_from_slice(&self.size.to_le_bytes());
        b[16..20].copy_from_slice(&self.i_u.to_le_bytes());
        b[20..24].copy_from_slice(&self.ino.to_le_bytes());
        b
    }

    pub fn layout(&self) -> u16 {
        layout_of(self.format)
    }
}

/// 64-byte inode, for sizes beyond u32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedInode {
    pub format: u16,
    pub mode: u16,
    pub size: u64,
    pub i_u: u32,
    pub ino: u32,
    pub nlink: u32,
}

impl ExtendedInode {
    pub fn encode(&self) -> [u8; EXTENDED_INODE_SIZE] {
        let mut b = [0u8; EXTENDED_INODE_SIZE];
        b[0..2].copy_from_slice(&(self.format | VERSION_EXTENDED).to_le_bytes());
        b[4..6].copy_from_slice(&self.mode.to_le_bytes());
        b[8..16].copy_from_slice(&self.size.to_le_bytes());
        b[16..20].copy_from_slice(&self.i_u.to_le_bytes());
        b[20..24].copy_from_slice(&self.ino.to_le_bytes());
        b[44..48].copy_from_slice(&self.nlink.to_le_bytes());
        b
    }
}

/// Either inode form as read back from an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub extended: bool,
    pub layout: u16,
    pub mode: u16,
    pub nlink: u32,
    pub size: u64,
    pub i_u: u32,
    pub ino: u32,
}

impl InodeInfo {
    pub fn inode_size(&self) -> usize {
        if self.extended {
            EXTENDED_INODE_SIZE
        } else {
            COMPACT_INODE_SIZE
        }
    }
}

/// Read the inode at `nid` given the metadata base address.
pub fn decode_inode(image: &[u8], meta_base: u64, nid: u64) -> Result<InodeInfo, DaemonError> {
    let at = (meta_base + (nid << INODE_SLOT_SHIFT)) as usize;
    need(image, at + COMPACT_INODE_SIZE, "inode")?;
    let b = &image[at..];
    let format = get_u16(b, 0);
    if format & VERSION_EXTENDED != 0 {
        need(image, at + EXTENDED_INODE_SIZE, "extended inode")?;
        Ok(InodeInfo {
            extended: true,
            layout: layout_of(format),
            mode: get_u16(b, 4),
            size: get_u64(b, 8),
            i_u: get_u32(b, 16),
            ino: get_u32(b, 20),
            nlink: get_u32(b, 44),
        })
    } else {
        Ok(InodeInfo {
            extended: false,
            layout: layout_of(format),
            mode: get_u16(b, 4),
            nlink: get_u16(b, 6) as u32,
            size: get_u32(b, 8) as u64,
            i_u: get_u32(b, 16),
            ino: get_u32(b, 20),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkIndex {
    pub device_id: u16,
    pub blkaddr: u32,
}

impl ChunkIndex {
    pub fn encode(&self) -> [u8; CHUNK_INDEX_SIZE] {
        let mut b = [0u8; CHUNK_INDEX_SIZE];
        b[2..4].copy_from_slice(&self.device_id.to_le_bytes());
        b[4..8].copy_from_slice(&self.blkaddr.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self, DaemonError> {
        need(b, CHUNK_INDEX_SIZE, "chunk index")?;
        Ok(Self {
            device_id: get_u16(b, 2),
            blkaddr: get_u32(b, 4),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    pub nid: u64,
    pub nameoff: u16,
    pub file_type: u8,
}

impl Dirent {
    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut b = [0u8; DIRENT_SIZE];
        b[0..8].copy_from_slice(&self.nid.to_le_bytes());
        b[8..10].copy_from_slice(&self.nameoff.to_le_bytes());
        b[10] = self.file_type;
        b
    }
}

/// Decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub nid: u64,
    pub file_type: u8,
}

/// Parse the entries of one directory block. `block` holds only the bytes
/// belonging to the directory (a tail is shorter than a block).
pub fn decode_dir_block(block: &[u8]) -> Result<Vec<DirEntryInfo>, DaemonError> {
    need(block, DIRENT_SIZE, "directory block")?;
    let first_nameoff = get_u16(block, 8) as usize;
    if first_nameoff % DIRENT_SIZE != 0 || first_nameoff == 0 || first_nameoff > block.len() {
        return Err(DaemonError::Verification(format!(
            "bad first nameoff {}",
            first_nameoff
        )));
    }
    let count = first_nameoff / DIRENT_SIZE;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let d = &block[i * DIRENT_SIZE..];
        let start = get_u16(d, 8) as usize;
        let end = if i + 1 < count {
            get_u16(&block[(i + 1) * DIRENT_SIZE..], 8) as usize
        } else {
            block.len()
        };
        if start > end || end > block.len() {
            return Err(DaemonError::Verification(format!("bad nameoff {}", start)));
        }
        let raw = &block[start..end];
        // the last name in a full block may be followed by zero padding
        let raw = match raw.iter().position(|&c| c == 0) {
            Some(n) => &raw[..n],
            None => raw,
        };
        out.push(DirEntryInfo {
            name: String::from_utf8_lossy(raw).into_owned(),
            nid: get_u64(d, 0),
            file_type: d[10],
        });
    }
    Ok(out)
}
