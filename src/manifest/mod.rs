//! Manifests
//!
//! A manifest describes one tree: every entry in traversal order (parents before
//! children) with its kind, size and either inline bytes or chunk digests.
//! Manifests arrive wrapped in a signed envelope (see `envelope`) and are
//! resolved through `resolver`.

pub mod envelope;
pub mod resolver;

pub use envelope::{EnvelopeEntry, SignedEnvelope, TrustedKeys};
pub use resolver::{ManifestResolver, ResolvedManifest};

use crate::error::DaemonError;
use crate::types::{Digest, GlobalParams};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Signing context for manifest envelopes.
pub const MANIFEST_CONTEXT: &str = "manifest";

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    #[serde(other)]
    Unsupported,
}

/// One file-tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path within the tree; the root is "/"
    pub path: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub executable: bool,
    pub size: u64,
    /// File contents for small files, link target for symlinks
    #[serde(default)]
    pub inline_data: Vec<u8>,
    /// Concatenated chunk digests for chunked files
    #[serde(default)]
    pub digests: Vec<u8>,
}

impl ManifestEntry {
    pub fn directory(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Directory,
            executable: false,
            size: 0,
            inline_data: Vec::new(),
            digests: Vec::new(),
        }
    }

    pub fn inline_file(path: &str, data: Vec<u8>, executable: bool) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Regular,
            executable,
            size: data.len() as u64,
            inline_data: data,
            digests: Vec::new(),
        }
    }

    pub fn chunked_file(path: &str, size: u64, digests: &[Digest], executable: bool) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Regular,
            executable,
            size,
            inline_data: Vec::new(),
            digests: digests.concat(),
        }
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Symlink,
            executable: false,
            size: target.len() as u64,
            inline_data: target.as_bytes().to_vec(),
            digests: Vec::new(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        !self.digests.is_empty()
    }

    /// Split the concatenated digest list.
    pub fn digest_list(&self, digest_bytes: usize) -> Result<Vec<Digest>, DaemonError> {
        if digest_bytes == 0 || self.digests.len() % digest_bytes != 0 {
            return Err(DaemonError::Verification(format!(
                "{}: digest list of {} bytes is not a multiple of {}",
                self.path,
                self.digests.len(),
                digest_bytes
            )));
        }
        Ok(self.digests.chunks(digest_bytes).map(|c| c.to_vec()).collect())
    }
}

/// Tree description decoded from an envelope body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Chunking parameters the tree was cut with, when the service states them
    #[serde(default)]
    pub params: Option<GlobalParams>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn decode(bytes: &[u8]) -> Result<Self, DaemonError> {
        bincode::deserialize(bytes)
            .map_err(|e| DaemonError::Verification(format!("manifest decode error: {}", e)))
    }

    pub fn encode(&self) -> Result<Vec<u8>, DaemonError> {
        Ok(bincode::serialize(self)?)
    }
}

/// Request sent to the manifest service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRequest {
    pub upstream: String,
    pub tree_hash: String,
    pub chunk_shift: u32,
    pub digest_algo: String,
    pub digest_bits: u32,
    pub small_file_cutoff: u64,
}

impl ManifestRequest {
    /// Deterministic cache key. The small file cutoff is not part of the key:
    /// the service may answer with a different cutoff than requested.
    pub fn cache_key(&self) -> String {
        let mut h = Sha256::new();
        h.update(b"styx-manifest-cache-v1\n");
        h.update(format!("u={}\n", self.upstream).as_bytes());
        h.update(format!("h={}\n", self.tree_hash).as_bytes());
        h.update(
            format!(
                "p={}:{}:{}\n",
                self.chunk_shift, self.digest_algo, self.digest_bits
            )
            .as_bytes(),
        );
        let encoded = URL_SAFE_NO_PAD.encode(h.finalize());
        format!("v1-{}", &encoded[..36])
    }
}

/// Digest of a chunk under the configured parameters: sha256, truncated.
pub fn chunk_digest(data: &[u8], digest_bytes: usize) -> Digest {
    let full = Sha256::digest(data);
    full[..digest_bytes.min(full.len())].to_vec()
}

/// Name a digest the way the chunk store addresses it.
pub fn digest_name(digest: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ManifestRequest {
        ManifestRequest {
            upstream: "https://cache.example.org".to_string(),
            tree_hash: "0123456789abcdfghijklmnpqrsvwxyz".to_string(),
            chunk_shift: 16,
            digest_algo: "sha256".to_string(),
            digest_bits: 192,
            small_file_cutoff: 224,
        }
    }

    #[test]
    fn test_cache_key_shape_and_stability() {
        let key = request().cache_key();
        assert!(key.starts_with("v1-"));
        assert_eq!(key.len(), 39);
        assert_eq!(key, request().cache_key());
    }

    #[test]
    fn test_cache_key_ignores_cutoff_but_not_params() {
        let mut other = request();
        other.small_file_cutoff = 4096;
        assert_eq!(other.cache_key(), request().cache_key());
        other.chunk_shift = 18;
        assert_ne!(other.cache_key(), request().cache_key());
    }

    #[test]
    fn test_digest_list_split() {
        let entry = ManifestEntry::chunked_file("/f", 10, &[vec![1; 24], vec![2; 24]], false);
        let list = entry.digest_list(24).unwrap();
        assert_eq!(list, vec![vec![1; 24], vec![2; 24]]);
        assert!(entry.digest_list(20).is_err());
    }

    #[test]
    fn test_unknown_kind_decodes_as_unsupported() {
        let kind: EntryKind = serde_json::from_str("\"Fifo\"").unwrap();
        assert_eq!(kind, EntryKind::Unsupported);
    }
}
