//! Manifest resolution
//!
//! Order of sources for a tree's envelope: the local store (when its cache key
//! matches), the remote manifest cache, then the manifest service. Whatever the
//! source, the envelope is verified before it is stored or used. Chunked bodies
//! are reassembled with bounded parallelism.

use super::envelope::{EnvelopeEntry, SignedEnvelope, TrustedKeys};
use super::{Manifest, ManifestRequest, MANIFEST_CONTEXT};
use crate::error::DaemonError;
use crate::store::{SledStore, StoredManifest};
use crate::types::GlobalParams;
use crate::upstream::{fetch_verified_chunk, Upstream};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A verified, decoded manifest plus the size of its envelope.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    pub envelope_size: u64,
}

pub struct ManifestResolver {
    store: SledStore,
    upstream: Arc<dyn Upstream>,
    keys: TrustedKeys,
    params: GlobalParams,
    small_file_cutoff: u64,
    parallelism: usize,
}

impl ManifestResolver {
    pub fn new(
        store: SledStore,
        upstream: Arc<dyn Upstream>,
        keys: TrustedKeys,
        params: GlobalParams,
        small_file_cutoff: u64,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            upstream,
            keys,
            params,
            small_file_cutoff,
            parallelism: parallelism.max(1),
        }
    }

    pub fn request_for(&self, upstream: &str, tree_hash: &str) -> ManifestRequest {
        ManifestRequest {
            upstream: upstream.to_string(),
            tree_hash: tree_hash.to_string(),
            chunk_shift: self.params.chunk_shift,
            digest_algo: self.params.digest_algo.clone(),
            digest_bits: self.params.digest_bits,
            small_file_cutoff: self.small_file_cutoff,
        }
    }

    /// Resolve, verify and decode the manifest for `tree_hash`.
    pub async fn resolve(&self, upstream: &str, tree_hash: &str) -> Result<ResolvedManifest, DaemonError> {
        let req = self.request_for(upstream, tree_hash);
        let cache_key = req.cache_key();

        let (bytes, from_store) = match self.store.get_manifest(tree_hash)? {
            Some(stored) if stored.cache_key == cache_key => {
                debug!(tree = %tree_hash, "Using stored manifest");
                (stored.envelope, true)
            }
            _ => (self.fetch_envelope(&req, &cache_key).await?, false),
        };

        let envelope = SignedEnvelope::decode(&bytes)?;
        let entry = self.keys.verify(MANIFEST_CONTEXT, &envelope)?;
        if let Some(params) = &entry.params {
            if *params != self.params {
                return Err(DaemonError::Verification(format!(
                    "chunked manifest params {:?} do not match {:?}",
                    params, self.params
                )));
            }
        }

        if !from_store {
            self.store.put_manifest(
                tree_hash,
                &StoredManifest {
                    cache_key,
                    envelope: bytes.clone(),
                },
            )?;
        }

        let body = if entry.inline_data.is_empty() {
            self.read_chunked(&entry).await?
        } else {
            entry.inline_data
        };
        let manifest = Manifest::decode(&body)?;
        if let Some(params) = &manifest.params {
            if *params != self.params {
                return Err(DaemonError::Verification(format!(
                    "manifest for {} was cut with {:?}, cache uses {:?}",
                    tree_hash, params, self.params
                )));
            }
        }
        info!(tree = %tree_hash, entries = manifest.entries.len(), "Resolved manifest");
        Ok(ResolvedManifest {
            manifest,
            envelope_size: bytes.len() as u64,
        })
    }

    async fn fetch_envelope(&self, req: &ManifestRequest, cache_key: &str) -> Result<Vec<u8>, DaemonError> {
        match self.upstream.fetch_cached_manifest(cache_key).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => debug!(key = %cache_key, error = %e, "Remote manifest cache miss"),
        }
        self.upstream.request_manifest(req).await.map_err(|e| {
            warn!(tree = %req.tree_hash, error = %e, "Manifest request failed");
            e
        })
    }

    /// Reassemble a chunked body: each chunk is fetched, verified and written at
    /// its precomputed offset.
    async fn read_chunked(&self, entry: &EnvelopeEntry) -> Result<Vec<u8>, DaemonError> {
        let digest_bytes = self.params.digest_bytes();
        let chunk_size = self.params.chunk_size() as usize;
        if digest_bytes == 0 || entry.digests.len() % digest_bytes != 0 {
            return Err(DaemonError::Verification(
                "chunked manifest digest list is malformed".to_string(),
            ));
        }
        let size = usize::try_from(entry.size)
            .map_err(|_| DaemonError::Verification("manifest too large".to_string()))?;
        let expected = size.div_ceil(chunk_size);
        let count = entry.digests.len() / digest_bytes;
        if count != expected {
            return Err(DaemonError::Verification(format!(
                "chunked manifest of {} bytes has {} digests, expected {}",
                size, count, expected
            )));
        }

        let mut body = vec![0u8; size];
        let upstream = self.upstream.as_ref();
        let fetches: Vec<_> = body
            .chunks_mut(chunk_size)
            .zip(entry.digests.chunks(digest_bytes))
            .map(|(slot, digest)| async move {
                let data = fetch_verified_chunk(upstream, digest).await?;
                if data.len() != slot.len() {
                    return Err(DaemonError::Verification(format!(
                        "manifest chunk is {} bytes, expected {}",
                        data.len(),
                        slot.len()
                    )));
                }
                slot.copy_from_slice(&data);
                Ok(())
            })
            .collect();
        stream::iter(fetches)
            .buffer_unordered(self.parallelism)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::{chunk_digest, ManifestEntry};
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeUpstream {
        envelope: Mutex<Option<Vec<u8>>>,
        chunks: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
        manifest_requests: AtomicUsize,
        cache_requests: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn request_manifest(&self, _req: &ManifestRequest) -> Result<Vec<u8>, DaemonError> {
            self.manifest_requests.fetch_add(1, Ordering::SeqCst);
            self.envelope
                .lock()
                .clone()
                .ok_or_else(|| DaemonError::ExternalFetch("down".to_string()))
        }

        async fn fetch_cached_manifest(&self, key: &str) -> Result<Vec<u8>, DaemonError> {
            self.cache_requests.fetch_add(1, Ordering::SeqCst);
            Err(DaemonError::NotFound(key.to_string()))
        }

        async fn fetch_chunk(&self, digest: &[u8]) -> Result<Vec<u8>, DaemonError> {
            self.chunks
                .lock()
                .get(digest)
                .cloned()
                .ok_or_else(|| DaemonError::NotFound("chunk".to_string()))
        }
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    fn keys() -> TrustedKeys {
        let mut keys = TrustedKeys::default();
        keys.insert("test-1", signing_key().verifying_key());
        keys
    }

    fn manifest() -> Manifest {
        Manifest {
            params: None,
            entries: vec![
                ManifestEntry::directory("/"),
                ManifestEntry::inline_file("/a", b"hello".to_vec(), false),
            ],
        }
    }

    fn resolver(up: Arc<FakeUpstream>, params: GlobalParams) -> ManifestResolver {
        let store = SledStore::temporary(&params).unwrap();
        ManifestResolver::new(store, up, keys(), params, 224, 4)
    }

    const TREE: &str = "0123456789abcdfghijklmnpqrsvwxyz";

    #[tokio::test]
    async fn test_inline_manifest_resolved_and_stored() {
        let up = Arc::new(FakeUpstream::default());
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: manifest().encode().unwrap(),
            digests: Vec::new(),
            params: None,
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &signing_key()).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());

        let r = resolver(up.clone(), GlobalParams::default());
        let resolved = r.resolve("up", TREE).await.unwrap();
        assert_eq!(resolved.manifest, manifest());
        assert_eq!(up.manifest_requests.load(Ordering::SeqCst), 1);

        // second resolve is served from the store
        r.resolve("up", TREE).await.unwrap();
        assert_eq!(up.manifest_requests.load(Ordering::SeqCst), 1);
        assert_eq!(up.cache_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chunked_manifest_reassembled() {
        let params = GlobalParams {
            chunk_shift: 4,
            ..GlobalParams::default()
        };
        let body = manifest().encode().unwrap();
        let up = Arc::new(FakeUpstream::default());
        let mut digests = Vec::new();
        for chunk in body.chunks(16) {
            let d = chunk_digest(chunk, params.digest_bytes());
            up.chunks.lock().insert(d.clone(), chunk.to_vec());
            digests.extend_from_slice(&d);
        }
        let entry = EnvelopeEntry {
            size: body.len() as u64,
            inline_data: Vec::new(),
            digests,
            params: Some(params.clone()),
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &signing_key()).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());

        let resolved = resolver(up, params).resolve("up", TREE).await.unwrap();
        assert_eq!(resolved.manifest, manifest());
    }

    #[tokio::test]
    async fn test_params_mismatch_rejected_and_not_stored() {
        let up = Arc::new(FakeUpstream::default());
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: Vec::new(),
            digests: Vec::new(),
            params: Some(GlobalParams {
                chunk_shift: 20,
                ..GlobalParams::default()
            }),
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &signing_key()).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());

        let r = resolver(up, GlobalParams::default());
        let err = r.resolve("up", TREE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
        assert!(r.store.get_manifest(TREE).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manifest_cut_with_other_params_rejected() {
        let up = Arc::new(FakeUpstream::default());
        let mut body = manifest();
        body.params = Some(GlobalParams {
            digest_bits: 256,
            ..GlobalParams::default()
        });
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: body.encode().unwrap(),
            digests: Vec::new(),
            params: None,
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &signing_key()).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());

        let err = resolver(up, GlobalParams::default()).resolve("up", TREE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);

        // matching params pass
        let up = Arc::new(FakeUpstream::default());
        body.params = Some(GlobalParams::default());
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: body.encode().unwrap(),
            digests: Vec::new(),
            params: None,
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &signing_key()).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());
        let resolved = resolver(up, GlobalParams::default()).resolve("up", TREE).await.unwrap();
        assert_eq!(resolved.manifest, body);
    }

    #[tokio::test]
    async fn test_unsigned_envelope_rejected() {
        let up = Arc::new(FakeUpstream::default());
        let other = SigningKey::from_bytes(&[3u8; 32]);
        let entry = EnvelopeEntry {
            size: 0,
            inline_data: manifest().encode().unwrap(),
            digests: Vec::new(),
            params: None,
        };
        let env = SignedEnvelope::sign(MANIFEST_CONTEXT, &entry, "test-1", &other).unwrap();
        *up.envelope.lock() = Some(env.encode().unwrap());

        let err = resolver(up, GlobalParams::default())
            .resolve("up", TREE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
    }
}
