//! Upstream services: the manifest service, the remote manifest cache and the
//! chunk store. Bodies from all three are zstd-compressed on the wire.

use crate::error::DaemonError;
use crate::manifest::{chunk_digest, digest_name, ManifestRequest};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

pub const MANIFEST_PATH: &str = "/manifest";
pub const CHUNK_READ_PATH: &str = "/chunk/";
pub const MANIFEST_CACHE_PATH: &str = "/manifest/";

/// Upstream capability used by the resolver and the slab read path.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Ask the manifest service to produce a manifest; returns envelope bytes.
    async fn request_manifest(&self, req: &ManifestRequest) -> Result<Vec<u8>, DaemonError>;

    /// Read a previously produced envelope by cache key.
    async fn fetch_cached_manifest(&self, cache_key: &str) -> Result<Vec<u8>, DaemonError>;

    /// Read one chunk by digest; returns the uncompressed chunk bytes.
    async fn fetch_chunk(&self, digest: &[u8]) -> Result<Vec<u8>, DaemonError>;
}

/// Fetch a chunk and check it against its digest.
pub async fn fetch_verified_chunk(
    upstream: &dyn Upstream,
    digest: &[u8],
) -> Result<Vec<u8>, DaemonError> {
    let data = upstream.fetch_chunk(digest).await?;
    let got = chunk_digest(&data, digest.len());
    if got != digest {
        return Err(DaemonError::Verification(format!(
            "chunk {} digest mismatch (got {})",
            digest_name(digest),
            digest_name(&got)
        )));
    }
    Ok(data)
}

/// HTTP implementation of `Upstream`.
pub struct HttpUpstream {
    client: reqwest::Client,
    manifester_url: String,
    chunk_read_url: String,
    manifest_cache_url: String,
}

impl HttpUpstream {
    pub fn new(
        manifester_url: &str,
        chunk_read_url: &str,
        manifest_cache_url: &str,
    ) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            manifester_url: manifester_url.trim_end_matches('/').to_string(),
            chunk_read_url: chunk_read_url.trim_end_matches('/').to_string(),
            manifest_cache_url: manifest_cache_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(builder: RequestBuilder) -> Result<Response, DaemonError> {
        let res = builder.send().await?;
        match res.status() {
            StatusCode::OK => Ok(res),
            StatusCode::NOT_FOUND => Err(DaemonError::NotFound(res.url().to_string())),
            status => Err(DaemonError::ExternalFetch(format!(
                "{} returned {}",
                res.url(),
                status
            ))),
        }
    }

    async fn read_compressed(res: Response) -> Result<Vec<u8>, DaemonError> {
        let body = res.bytes().await?;
        zstd::decode_all(body.as_ref())
            .map_err(|e| DaemonError::ExternalFetch(format!("decompress error: {}", e)))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn request_manifest(&self, req: &ManifestRequest) -> Result<Vec<u8>, DaemonError> {
        let url = format!("{}{}", self.manifester_url, MANIFEST_PATH);
        debug!(url = %url, tree = %req.tree_hash, "Requesting manifest");
        let res = Self::send(self.client.post(&url).json(req)).await?;
        Self::read_compressed(res).await
    }

    async fn fetch_cached_manifest(&self, cache_key: &str) -> Result<Vec<u8>, DaemonError> {
        let url = format!("{}{}{}", self.manifest_cache_url, MANIFEST_CACHE_PATH, cache_key);
        let res = Self::send(self.client.get(&url)).await?;
        Self::read_compressed(res).await
    }

    async fn fetch_chunk(&self, digest: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let url = format!("{}{}{}", self.chunk_read_url, CHUNK_READ_PATH, digest_name(digest));
        let res = Self::send(self.client.get(&url)).await?;
        Self::read_compressed(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct OneChunk(Vec<u8>);

    #[async_trait]
    impl Upstream for OneChunk {
        async fn request_manifest(&self, _req: &ManifestRequest) -> Result<Vec<u8>, DaemonError> {
            Err(DaemonError::NotFound("manifest".to_string()))
        }

        async fn fetch_cached_manifest(&self, _key: &str) -> Result<Vec<u8>, DaemonError> {
            Err(DaemonError::NotFound("manifest".to_string()))
        }

        async fn fetch_chunk(&self, _digest: &[u8]) -> Result<Vec<u8>, DaemonError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_verified_chunk_accepts_matching_digest() {
        let data = b"hello chunk".to_vec();
        let digest = chunk_digest(&data, 24);
        let up = OneChunk(data.clone());
        assert_eq!(fetch_verified_chunk(&up, &digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_verified_chunk_rejects_mismatch() {
        let digest = chunk_digest(b"expected", 24);
        let up = OneChunk(b"something else".to_vec());
        let err = fetch_verified_chunk(&up, &digest).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
    }
}
