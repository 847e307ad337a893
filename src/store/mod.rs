//! Persisted state
//!
//! Record types for the embedded store and the `ImageRecordStore` port the mount
//! state machine and image open path use. The sled-backed implementation lives
//! in `persistence`.

pub mod persistence;

pub use persistence::SledStore;

use crate::error::StorageError;
use crate::types::{SlabId, SlabLoc};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Mount state of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountState {
    Unmounted,
    Requested,
    Mounted,
    UnmountRequested,
    MountError,
}

/// ChunkRecord: where a digest lives and which trees reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub loc: SlabLoc,
    pub blocks: u32,
    pub owners: BTreeSet<String>,
}

/// ImageRecord: per tree hash mount intent and image facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub tree_hash: String,
    pub tree_path: String,
    pub upstream: String,
    pub mount_point: String,
    pub mount_state: MountState,
    pub manifest_size: u64,
    pub image_size: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(tree_hash: &str, tree_path: &str, upstream: &str, mount_point: &str) -> Self {
        Self {
            tree_hash: tree_hash.to_string(),
            tree_path: tree_path.to_string(),
            upstream: upstream.to_string(),
            mount_point: mount_point.to_string(),
            mount_state: MountState::Unmounted,
            manifest_size: 0,
            image_size: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Locally cached signed manifest envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredManifest {
    pub cache_key: String,
    pub envelope: Vec<u8>,
}

/// Slab index entry: digest at a base address, spanning `blocks` addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabEntry {
    pub addr: u32,
    pub digest: Vec<u8>,
    pub blocks: u32,
}

/// Per-tree record store interface
pub trait ImageRecordStore: Send + Sync {
    fn get_image(&self, tree_hash: &str) -> Result<Option<ImageRecord>, StorageError>;
    fn put_image(&self, record: &ImageRecord) -> Result<(), StorageError>;
    fn list_images(&self) -> Result<Vec<ImageRecord>, StorageError>;
}

/// Encode a slab index key: slab id then block address, both big endian so
/// sled's byte ordering matches address ordering.
pub fn slab_key(slab_id: SlabId, addr: u32) -> [u8; 6] {
    let mut key = [0u8; 6];
    key[..2].copy_from_slice(&slab_id.to_be_bytes());
    key[2..].copy_from_slice(&addr.to_be_bytes());
    key
}

pub fn parse_slab_key(key: &[u8]) -> Result<(SlabId, u32), StorageError> {
    if key.len() != 6 {
        return Err(StorageError::Corrupt {
            key: hex::encode(key),
            reason: format!("slab key length {}", key.len()),
        });
    }
    let slab_id = u16::from_be_bytes([key[0], key[1]]);
    let addr = u32::from_be_bytes([key[2], key[3], key[4], key[5]]);
    Ok((slab_id, addr))
}

/// Slab index value: digest followed by the block count (u32 BE).
pub fn slab_value(digest: &[u8], blocks: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(digest.len() + 4);
    v.extend_from_slice(digest);
    v.extend_from_slice(&blocks.to_be_bytes());
    v
}

pub fn parse_slab_value(addr: u32, value: &[u8]) -> Result<SlabEntry, StorageError> {
    if value.len() < 5 {
        return Err(StorageError::Corrupt {
            key: format!("addr {}", addr),
            reason: format!("slab value length {}", value.len()),
        });
    }
    let split = value.len() - 4;
    let blocks = u32::from_be_bytes([value[split], value[split + 1], value[split + 2], value[split + 3]]);
    Ok(SlabEntry {
        addr,
        digest: value[..split].to_vec(),
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_key_orders_by_address() {
        let a = slab_key(1, 0x00ff);
        let b = slab_key(1, 0x0100);
        let c = slab_key(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(parse_slab_key(&b).unwrap(), (1, 0x0100));
    }

    #[test]
    fn test_slab_value_parse() {
        let v = slab_value(&[7u8; 24], 3);
        let entry = parse_slab_value(42, &v).unwrap();
        assert_eq!(entry.digest, vec![7u8; 24]);
        assert_eq!(entry.blocks, 3);
        assert!(parse_slab_value(0, &[1, 2]).is_err());
    }
}
