//! Chunk/Slab Allocator
//!
//! Persistent content-addressed mapping from digest to slab location. Every
//! mutation runs inside one sled transaction over the `meta`, `chunks` and
//! `slabs` trees; that transaction is the only serialization point, so
//! concurrent callers never see colliding addresses.
//!
//! Addresses within a slab come from a per-slab sequence counter that only
//! moves forward. The first `RESERVED_BLOCKS` addresses are never handed out.
//! A batch is never split across slabs: if its new blocks do not fit in the
//! current slab the whole batch moves to the next slab id.

use crate::error::{DaemonError, StorageError};
use crate::store::{
    parse_slab_key, parse_slab_value, slab_key, slab_value, ChunkRecord, SledStore,
};
use crate::types::{BlockShift, Digest, SlabId, SlabLoc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
};
use sled::Transactional;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Addresses below this are never allocated in any slab.
pub const RESERVED_BLOCKS: u32 = 16;

/// Virtual size of one slab, in bytes (as a shift).
pub const SLAB_BYTES_SHIFT: u32 = 40;

/// Cookie/device tag prefix of raw slab objects.
pub const SLAB_TAG_PREFIX: &str = "_slab_";
/// Cookie prefix of synthetic slab images.
pub const SLAB_IMAGE_TAG_PREFIX: &str = "_slabimg_";

const META_CURRENT_SLAB: &[u8] = b"slab/current";
const META_SEQ_PREFIX: &[u8] = b"slab/seq/";

/// A chunk located by address: its digest, base address and span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub digest: Digest,
    pub base: u32,
    pub blocks: u32,
}

/// Summary of one allocated chunk, for the debug surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub digest: String,
    pub slab_id: SlabId,
    pub addr: u32,
    pub blocks: u32,
    pub owners: Vec<String>,
}

pub struct SlabAllocator {
    store: SledStore,
    block_shift: BlockShift,
}

pub fn slab_tag(slab_id: SlabId) -> String {
    format!("{}{}", SLAB_TAG_PREFIX, slab_id)
}

/// Address capacity of a single slab for a block size.
pub fn slab_capacity_blocks(block_shift: BlockShift) -> u64 {
    (1u64 << (SLAB_BYTES_SHIFT - block_shift.0)).min(u32::MAX as u64)
}

fn seq_key(slab_id: SlabId) -> Vec<u8> {
    let mut key = META_SEQ_PREFIX.to_vec();
    key.extend_from_slice(&slab_id.to_be_bytes());
    key
}

fn abort<T>(e: impl Into<StorageError>) -> Result<T, ConflictableTransactionError<DaemonError>> {
    Err(ConflictableTransactionError::Abort(DaemonError::Storage(e.into())))
}

fn read_u64(tree: &TransactionalTree, key: &[u8]) -> Result<Option<u64>, ConflictableTransactionError<DaemonError>> {
    match tree.get(key)? {
        Some(v) if v.len() == 8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&v);
            Ok(Some(u64::from_be_bytes(b)))
        }
        Some(v) => abort(StorageError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: format!("counter length {}", v.len()),
        }),
        None => Ok(None),
    }
}

fn unwrap_tx<T>(result: Result<T, TransactionError<DaemonError>>) -> Result<T, DaemonError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => DaemonError::Storage(StorageError::Sled(e)),
    })
}

impl SlabAllocator {
    pub fn new(store: SledStore, block_shift: BlockShift) -> Self {
        Self { store, block_shift }
    }

    pub fn block_shift(&self) -> BlockShift {
        self.block_shift
    }

    /// Address capacity of a single slab.
    pub fn capacity_blocks(&self) -> u64 {
        slab_capacity_blocks(self.block_shift)
    }

    /// Fail fast when the image builder was configured differently from the cache.
    pub fn verify_params(&self, digest_bytes: usize, block_size: u64, chunk_size: u64) -> Result<(), DaemonError> {
        let params = self.store.params();
        if digest_bytes != params.digest_bytes()
            || block_size != self.block_shift.size()
            || chunk_size != params.chunk_size()
        {
            return Err(DaemonError::Verification(format!(
                "mismatched params: digest {} vs {}, block {} vs {}, chunk {} vs {}",
                digest_bytes,
                params.digest_bytes(),
                block_size,
                self.block_shift.size(),
                chunk_size,
                params.chunk_size()
            )));
        }
        Ok(())
    }

    /// Device tag and size of a slab.
    pub fn slab_info(&self, slab_id: SlabId) -> (String, u32) {
        (slab_tag(slab_id), self.capacity_blocks() as u32)
    }

    /// Reserve addresses for every digest not already allocated, and record
    /// `owner` against every digest in the batch.
    pub fn allocate_batch(
        &self,
        block_counts: &[u32],
        digests: &[Digest],
        owner: &str,
    ) -> Result<Vec<SlabLoc>, DaemonError> {
        if block_counts.len() != digests.len() {
            return Err(DaemonError::InvalidRequest(format!(
                "{} block counts for {} digests",
                block_counts.len(),
                digests.len()
            )));
        }
        let digest_bytes = self.store.params().digest_bytes();
        if let Some(bad) = digests.iter().find(|d| d.len() != digest_bytes) {
            return Err(DaemonError::InvalidRequest(format!(
                "digest {} is {} bytes, expected {}",
                hex::encode(bad),
                bad.len(),
                digest_bytes
            )));
        }
        if let Some(i) = block_counts.iter().position(|&b| b == 0) {
            return Err(DaemonError::InvalidRequest(format!(
                "zero-length allocation for digest {}",
                hex::encode(&digests[i])
            )));
        }
        let capacity = self.capacity_blocks();

        let result = (&self.store.meta, &self.store.chunks, &self.store.slabs).transaction(
            |(meta, chunks, slabs)| {
                let mut existing: HashMap<&[u8], ChunkRecord> = HashMap::new();
                let mut fresh: Vec<usize> = Vec::new();
                let mut seen: BTreeSet<&[u8]> = BTreeSet::new();
                let mut new_blocks = 0u64;

                for (i, digest) in digests.iter().enumerate() {
                    if !seen.insert(digest.as_slice()) {
                        continue;
                    }
                    match chunks.get(digest.as_slice())? {
                        Some(bytes) => {
                            let rec: ChunkRecord = match bincode::deserialize(&bytes) {
                                Ok(r) => r,
                                Err(e) => return abort(e),
                            };
                            existing.insert(digest.as_slice(), rec);
                        }
                        None => {
                            fresh.push(i);
                            new_blocks += block_counts[i] as u64;
                        }
                    }
                }

                let mut slab_id: SlabId = match meta.get(META_CURRENT_SLAB)? {
                    Some(v) if v.len() == 2 => u16::from_be_bytes([v[0], v[1]]),
                    Some(v) => {
                        return abort(StorageError::Corrupt {
                            key: "slab/current".to_string(),
                            reason: format!("length {}", v.len()),
                        })
                    }
                    None => 0,
                };
                let mut seq = read_u64(meta, &seq_key(slab_id))?.unwrap_or(RESERVED_BLOCKS as u64);

                if !fresh.is_empty() {
                    if new_blocks > capacity - RESERVED_BLOCKS as u64 {
                        return Err(ConflictableTransactionError::Abort(DaemonError::InvalidRequest(
                            format!("batch of {} blocks exceeds slab capacity", new_blocks),
                        )));
                    }
                    if seq + new_blocks > capacity {
                        slab_id = match slab_id.checked_add(1) {
                            Some(id) => id,
                            None => {
                                return Err(ConflictableTransactionError::Abort(DaemonError::Storage(
                                    StorageError::Corrupt {
                                        key: "slab/current".to_string(),
                                        reason: "slab ids exhausted".to_string(),
                                    },
                                )))
                            }
                        };
                        seq = read_u64(meta, &seq_key(slab_id))?.unwrap_or(RESERVED_BLOCKS as u64);
                        meta.insert(META_CURRENT_SLAB, &slab_id.to_be_bytes())?;
                    }
                }

                let mut assigned: HashMap<&[u8], SlabLoc> = HashMap::new();
                for &i in &fresh {
                    let loc = SlabLoc {
                        slab_id,
                        addr: seq as u32,
                    };
                    seq += block_counts[i] as u64;
                    let rec = ChunkRecord {
                        loc,
                        blocks: block_counts[i],
                        owners: BTreeSet::from([owner.to_string()]),
                    };
                    let bytes = match bincode::serialize(&rec) {
                        Ok(b) => b,
                        Err(e) => return abort(e),
                    };
                    chunks.insert(digests[i].as_slice(), bytes)?;
                    slabs.insert(
                        &slab_key(loc.slab_id, loc.addr)[..],
                        slab_value(&digests[i], block_counts[i]),
                    )?;
                    assigned.insert(digests[i].as_slice(), loc);
                }
                if !fresh.is_empty() {
                    meta.insert(seq_key(slab_id), &seq.to_be_bytes()[..])?;
                }

                for (digest, rec) in existing.iter_mut() {
                    if rec.owners.insert(owner.to_string()) {
                        let bytes = match bincode::serialize(&*rec) {
                            Ok(b) => b,
                            Err(e) => return abort(e),
                        };
                        chunks.insert(*digest, bytes)?;
                    }
                    assigned.insert(*digest, rec.loc);
                }

                let mut out = Vec::with_capacity(digests.len());
                for digest in digests {
                    match assigned.get(digest.as_slice()) {
                        Some(loc) => out.push(*loc),
                        None => {
                            return Err(ConflictableTransactionError::Abort(DaemonError::Fault(
                                format!("digest {} left unassigned", hex::encode(digest)),
                            )))
                        }
                    }
                }
                Ok((out, fresh.len()))
            },
        );

        let (out, allocated) = unwrap_tx(result)?;
        debug!(
            owner = %owner,
            requested = digests.len(),
            allocated,
            "Allocated chunk batch"
        );
        Ok(out)
    }

    /// Read-only location lookup; unknown digests are an error.
    pub fn lookup(&self, digests: &[Digest]) -> Result<Vec<SlabLoc>, DaemonError> {
        digests
            .iter()
            .map(|d| Ok(self.get_record(d)?.loc))
            .collect()
    }

    pub fn get_record(&self, digest: &[u8]) -> Result<ChunkRecord, DaemonError> {
        match self.store.chunks.get(digest)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(DaemonError::NotFound(format!("digest {}", hex::encode(digest)))),
        }
    }

    /// Find the chunk whose span covers `addr` in `slab_id`.
    pub fn seek_containing_chunk(&self, slab_id: SlabId, addr: u32) -> Result<ChunkSpan, DaemonError> {
        let lo = slab_key(slab_id, 0);
        let hi = slab_key(slab_id, addr);
        let (key, value) = match self.store.slabs.range(&lo[..]..=&hi[..]).next_back() {
            Some(item) => item?,
            None => {
                return Err(DaemonError::NotFound(format!(
                    "no chunk at or below {} in slab {}",
                    addr, slab_id
                )))
            }
        };
        let (_, base) = parse_slab_key(&key)?;
        let entry = parse_slab_value(base, &value)?;
        if (addr as u64) >= base as u64 + entry.blocks as u64 {
            return Err(DaemonError::NotFound(format!(
                "address {} in slab {} falls past chunk at {}+{}",
                addr, slab_id, base, entry.blocks
            )));
        }
        Ok(ChunkSpan {
            digest: entry.digest,
            base,
            blocks: entry.blocks,
        })
    }

    /// Next unallocated address of each slab that has one.
    pub fn slab_sequences(&self) -> Result<Vec<(SlabId, u64)>, DaemonError> {
        let mut out = Vec::new();
        for item in self.store.meta.scan_prefix(META_SEQ_PREFIX) {
            let (key, value) = item?;
            let id = &key[META_SEQ_PREFIX.len()..];
            if id.len() != 2 || value.len() != 8 {
                warn!(key = %hex::encode(&key), "Skipping malformed slab counter");
                continue;
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&value);
            out.push((u16::from_be_bytes([id[0], id[1]]), u64::from_be_bytes(b)));
        }
        Ok(out)
    }

    pub fn list_chunks(&self) -> Result<Vec<ChunkSummary>, DaemonError> {
        let mut out = Vec::new();
        for item in self.store.chunks.iter() {
            let (key, value) = item?;
            let rec: ChunkRecord = bincode::deserialize(&value)?;
            out.push(ChunkSummary {
                digest: hex::encode(&key),
                slab_id: rec.loc.slab_id,
                addr: rec.loc.addr,
                blocks: rec.blocks,
                owners: rec.owners.into_iter().collect(),
            });
        }
        Ok(out)
    }
}
