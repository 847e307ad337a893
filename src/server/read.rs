//! READ handling.

use super::{CacheServer, ObjectKind, OpenObject};
use crate::error::DaemonError;
use crate::manifest::digest_name;
use crate::types::SlabId;
use crate::upstream::fetch_verified_chunk;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

impl CacheServer {
    /// Service one READ. Every read on a known object is completed exactly
    /// once, whether servicing succeeds, fails or panics.
    pub(super) async fn handle_read(&self, msg_id: u32, object_id: u32, off: u64, len: u64) -> Result<(), DaemonError> {
        let Some(object) = self.object(object_id) else {
            warn!(msg_id, object_id, "Read for unknown object");
            return Err(DaemonError::NotFound(format!("object {}", object_id)));
        };

        let result = AssertUnwindSafe(self.service_read(&object, off, len))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DaemonError::Fault("read handler panicked".to_string())));
        if let Err(e) = &result {
            warn!(msg_id, object_id, off, len, kind = ?e.kind(), error = %e, "Read failed");
        }

        let completion = object.file.complete_read(msg_id);
        result.and(completion)
    }

    async fn service_read(&self, object: &Arc<OpenObject>, off: u64, len: u64) -> Result<(), DaemonError> {
        match &object.kind {
            ObjectKind::Image { pending } => {
                let Some(image) = pending.lock().take() else {
                    return Err(DaemonError::NotFound(format!(
                        "image {} bytes already released",
                        object.cookie
                    )));
                };
                debug!(tree = %object.cookie, bytes = image.len(), "Writing image");
                if let Err(e) = object.file.write_at(&image, 0) {
                    // keep the bytes for a retried read
                    *pending.lock() = Some(image);
                    return Err(e);
                }
                Ok(())
            }
            ObjectKind::SlabImage { image } => object.file.write_at(image.read_at(off, len)?, off),
            ObjectKind::Slab { slab_id } => self.read_slab(object, *slab_id, off, len).await,
        }
    }

    /// Fill the chunk containing `off` in a slab object. Concurrent reads of
    /// the same chunk share one fetch.
    async fn read_slab(&self, object: &Arc<OpenObject>, slab_id: SlabId, off: u64, len: u64) -> Result<(), DaemonError> {
        let chunk_size = self.config.params.chunk_size();
        if len > chunk_size {
            return Err(DaemonError::InvalidRequest(format!(
                "read of {} bytes exceeds chunk size {}",
                len, chunk_size
            )));
        }
        let shift = self.config.block_shift;
        let addr = u32::try_from(off >> shift.0)
            .map_err(|_| DaemonError::InvalidRequest(format!("offset {} beyond slab", off)))?;
        let span = self.allocator.seek_containing_chunk(slab_id, addr)?;
        let base_off = (span.base as u64) << shift.0;
        let span_bytes = (span.blocks as u64) << shift.0;

        let needed = off.saturating_add(len).min(base_off + span_bytes) - base_off;
        let short = |digest: &[u8], got: u64| {
            DaemonError::Verification(format!(
                "chunk {} is {} bytes, read needs {}",
                digest_name(digest),
                got,
                needed
            ))
        };

        let upstream = self.upstream.clone();
        let file = object.file.clone();
        let digest = span.digest.clone();
        let fetched = self
            .fetches
            .execute(span.digest.clone(), || async move {
                let mut data = fetch_verified_chunk(upstream.as_ref(), &digest).await?;
                let got = data.len() as u64;
                if got > span_bytes {
                    return Err(DaemonError::Verification(format!(
                        "chunk {} is {} bytes, larger than its {} byte span",
                        digest_name(&digest),
                        got,
                        span_bytes
                    )));
                }
                // nothing reaches the backing file unless it covers this read
                if shift.roundup(got) < needed {
                    return Err(short(&digest, got));
                }
                data.resize(shift.roundup(got) as usize, 0);
                file.write_at(&data, base_off)?;
                Ok(got)
            })
            .await?;

        // a waiter may need more of the chunk than the leader did
        if shift.roundup(*fetched) < needed {
            return Err(short(&span.digest, *fetched));
        }
        Ok(())
    }
}
