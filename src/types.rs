//! Core types shared by the allocator, image builder and kernel bridge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest: content hash of a chunk, `digest_bits / 8` bytes wide.
pub type Digest = Vec<u8>;

/// Slab identifier. Device slot `slab_id + 1` in built images.
pub type SlabId = u16;

/// Block address within a slab's virtual address space.
pub type BlockAddr = u32;

/// Length of a tree hash as it appears in store paths and cookie keys.
pub const TREE_HASH_LEN: usize = 32;

/// Alphabet of nix-style base32 tree hashes.
pub const TREE_HASH_ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

/// SlabLoc: first block of a chunk within a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlabLoc {
    pub slab_id: SlabId,
    pub addr: BlockAddr,
}

impl fmt::Display for SlabLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slab_id, self.addr)
    }
}

/// Global parameters every chunk digest and manifest is computed under.
///
/// These are persisted on first start and a cache built under one set of
/// parameters cannot be reused under another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalParams {
    pub chunk_shift: u32,
    pub digest_algo: String,
    pub digest_bits: u32,
}

impl GlobalParams {
    pub fn digest_bytes(&self) -> usize {
        (self.digest_bits / 8) as usize
    }

    pub fn chunk_size(&self) -> u64 {
        1u64 << self.chunk_shift
    }
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            chunk_shift: 16,
            digest_algo: "sha256".to_string(),
            digest_bits: 192,
        }
    }
}

/// Block size exponent helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockShift(pub u32);

impl BlockShift {
    pub fn size(self) -> u64 {
        1u64 << self.0
    }

    /// Bytes past the last full block.
    pub fn leftover(self, n: u64) -> u64 {
        n & (self.size() - 1)
    }

    pub fn roundup(self, n: u64) -> u64 {
        (n + self.size() - 1) & !(self.size() - 1)
    }

    /// Number of blocks needed to hold `n` bytes.
    pub fn blocks(self, n: u64) -> u64 {
        self.roundup(n) >> self.0
    }
}

/// Returns true if `s` looks like a tree hash (32 chars of nix base32).
pub fn is_tree_hash(s: &str) -> bool {
    s.len() == TREE_HASH_LEN && s.chars().all(|c| TREE_HASH_ALPHABET.contains(c))
}
