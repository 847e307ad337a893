//! OPEN and CLOSE handling.

use super::{CacheServer, ObjectKind, OpenObject};
use crate::error::DaemonError;
use crate::image::SlabImage;
use crate::kernel::wire::{volume_key, Command, SLAB_OBJECT_SIZE};
use crate::kernel::ObjectFile;
use crate::slab::{slab_tag, SLAB_IMAGE_TAG_PREFIX, SLAB_TAG_PREFIX};
use crate::store::{ImageRecord, ImageRecordStore};
use crate::types::{is_tree_hash, SlabId};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

fn parse_slab_id(cookie: &str, prefix: &str) -> Result<SlabId, DaemonError> {
    cookie[prefix.len()..]
        .parse::<SlabId>()
        .map_err(|_| DaemonError::InvalidRequest(format!("bad slab cookie {:?}", cookie)))
}

impl CacheServer {
    /// Resolve the object and reply with its size, or with -ENODEV on any
    /// failure. A failed open drops the descriptor after the reply.
    pub(super) async fn handle_open(
        &self,
        msg_id: u32,
        object_id: u32,
        fd: u32,
        volume: &[u8],
        cookie: &[u8],
    ) -> Result<(), DaemonError> {
        let mut held = None;
        let outcome = match self.device.object_file(fd) {
            Ok(file) => {
                held = Some(file.clone());
                AssertUnwindSafe(self.open_object(object_id, file, volume, cookie))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(DaemonError::Fault("open handler panicked".to_string())))
            }
            Err(e) => Err(e),
        };
        let size = match &outcome {
            Ok(size) => *size,
            Err(e) => {
                warn!(msg_id, object_id, kind = ?e.kind(), error = %e, "Open failed");
                -(libc::ENODEV as i64)
            }
        };
        let reply = self.device.write_command(&Command::Copen { msg_id, size });
        drop(held);
        reply?;
        outcome.map(|_| ())
    }

    async fn open_object(
        &self,
        object_id: u32,
        file: Arc<dyn ObjectFile>,
        volume: &[u8],
        cookie: &[u8],
    ) -> Result<i64, DaemonError> {
        if volume != volume_key(&self.config.domain_id).as_slice() {
            return Err(DaemonError::InvalidRequest(format!(
                "wrong domain {:?}",
                String::from_utf8_lossy(volume)
            )));
        }
        let cookie = std::str::from_utf8(cookie)
            .map_err(|_| DaemonError::InvalidRequest("cookie is not utf-8".to_string()))?
            .trim_end_matches('\0');

        if cookie.starts_with(SLAB_IMAGE_TAG_PREFIX) {
            let slab_id = parse_slab_id(cookie, SLAB_IMAGE_TAG_PREFIX)?;
            let image = SlabImage::new(slab_id, self.config.block_shift)?;
            let size = image.size() as i64;
            self.insert_object(
                object_id,
                OpenObject {
                    cookie: cookie.to_string(),
                    file,
                    kind: ObjectKind::SlabImage { image },
                },
            );
            Ok(size)
        } else if cookie.starts_with(SLAB_TAG_PREFIX) {
            let slab_id = parse_slab_id(cookie, SLAB_TAG_PREFIX)?;
            self.insert_object(
                object_id,
                OpenObject {
                    cookie: cookie.to_string(),
                    file,
                    kind: ObjectKind::Slab { slab_id },
                },
            );
            if self.config.mount_slab_images {
                self.schedule_slab_image_mount(slab_id);
            }
            Ok(SLAB_OBJECT_SIZE)
        } else if is_tree_hash(cookie) {
            self.open_image(object_id, file, cookie).await
        } else {
            Err(DaemonError::InvalidRequest(format!("bad fsid {:?}", cookie)))
        }
    }

    async fn open_image(&self, object_id: u32, file: Arc<dyn ObjectFile>, hash: &str) -> Result<i64, DaemonError> {
        let record = self.store.get_image(hash)?;
        if let Some(rec) = &record {
            if rec.image_size > 0 {
                self.insert_object(
                    object_id,
                    OpenObject {
                        cookie: hash.to_string(),
                        file,
                        kind: ObjectKind::Image {
                            pending: Mutex::new(None),
                        },
                    },
                );
                return Ok(rec.image_size as i64);
            }
        }

        let upstream = match &record {
            Some(rec) if !rec.upstream.is_empty() => rec.upstream.clone(),
            _ => self.config.default_upstream.clone(),
        };
        if upstream.is_empty() {
            return Err(DaemonError::InvalidRequest(format!("no upstream known for {}", hash)));
        }

        let resolved = self.resolver.resolve(&upstream, hash).await?;
        let builder = self.builder.clone();
        let allocator = self.allocator.clone();
        let owner = hash.to_string();
        let manifest = resolved.manifest;
        let image = tokio::task::spawn_blocking(move || builder.build(&manifest, &owner, allocator.as_ref()))
            .await
            .map_err(|e| DaemonError::Fault(format!("image build task: {}", e)))??;

        // re-read: a mount may have moved the record on while we built
        let mut rec = self
            .store
            .get_image(hash)?
            .unwrap_or_else(|| ImageRecord::new(hash, "", &upstream, ""));
        rec.manifest_size = resolved.envelope_size;
        rec.image_size = image.len() as u64;
        rec.updated_at = chrono::Utc::now();
        self.store.put_image(&rec)?;
        info!(
            tree = %hash,
            manifest_bytes = rec.manifest_size,
            image_bytes = rec.image_size,
            "Built new image"
        );

        let size = image.len() as i64;
        self.insert_object(
            object_id,
            OpenObject {
                cookie: hash.to_string(),
                file,
                kind: ObjectKind::Image {
                    pending: Mutex::new(Some(image)),
                },
            },
        );
        Ok(size)
    }

    /// Mount the slab's synthetic image in the background; the mount itself
    /// triggers an OPEN for the image cookie that another worker serves.
    fn schedule_slab_image_mount(&self, slab_id: SlabId) {
        let mount_point = self.config.slab_mount_dir.join(slab_id.to_string());
        {
            let mut mounts = self.slab_mounts.lock();
            if mounts.contains_key(&slab_id) {
                return;
            }
            mounts.insert(slab_id, mount_point.clone());
        }
        let mounter = self.mounter.clone();
        let mounts = self.slab_mounts.clone();
        let fsid = format!("{}{}", SLAB_IMAGE_TAG_PREFIX, slab_id);
        tokio::task::spawn_blocking(move || match mounter.mount(&fsid, &mount_point) {
            Ok(()) => info!(slab_id, mount_point = %mount_point.display(), "Mounted slab image"),
            Err(e) => {
                // forget it so the next open of this slab tries again
                mounts.lock().remove(&slab_id);
                warn!(slab_id, error = %e, "Mounting slab image failed");
            }
        });
    }

    pub(super) async fn handle_close(&self, object_id: u32) -> Result<(), DaemonError> {
        let removed = self.objects.lock().remove(&object_id);
        let Some(object) = removed else {
            warn!(object_id, "Close for unknown object");
            return Ok(());
        };
        info!(object_id, cookie = %object.cookie, "Object closed");
        if let ObjectKind::Slab { slab_id } = object.kind {
            let mount_point = self.slab_mounts.lock().remove(&slab_id);
            if let Some(mount_point) = mount_point {
                let mounter = self.mounter.clone();
                let tag = slab_tag(slab_id);
                tokio::task::spawn_blocking(move || mounter.unmount(&mount_point))
                    .await
                    .map_err(|e| DaemonError::Fault(format!("unmount task: {}", e)))?
                    .map_err(|e| {
                        warn!(slab = %tag, error = %e, "Unmounting slab image failed");
                        e
                    })?;
            }
        }
        Ok(())
    }
}
