//! Cache server
//!
//! Implements `MessageHandler` for the kernel bridge. OPEN resolves a cookie to
//! one of three object kinds and replies with its size; READ fills the object
//! from the matching source and always completes exactly once; CLOSE drops the
//! object (closing its descriptor).

mod open;
mod read;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::image::{ImageBuilder, SlabImage};
use crate::kernel::{CacheDevice, Message, MessageHandler, ObjectFile};
use crate::manifest::ManifestResolver;
use crate::mount::Mounter;
use crate::singleflight::SingleFlight;
use crate::slab::SlabAllocator;
use crate::store::SledStore;
use crate::types::{BlockShift, Digest, GlobalParams, SlabId};
use crate::upstream::Upstream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Server settings derived from `DaemonConfig`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub domain_id: String,
    pub block_shift: BlockShift,
    pub params: GlobalParams,
    pub default_upstream: String,
    pub mount_slab_images: bool,
    pub slab_mount_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_daemon(config: &DaemonConfig) -> Self {
        Self {
            domain_id: config.domain_id.clone(),
            block_shift: config.block_shift(),
            params: config.params.clone(),
            default_upstream: config.upstream.clone(),
            mount_slab_images: config.mount_slab_images,
            slab_mount_dir: config.slab_mount_dir(),
        }
    }
}

pub(crate) enum ObjectKind {
    /// Tree image; bytes are held until the first read writes them out
    Image { pending: Mutex<Option<Vec<u8>>> },
    /// Raw slab backing store, filled chunk by chunk
    Slab { slab_id: SlabId },
    SlabImage { image: SlabImage },
}

impl ObjectKind {
    fn name(&self) -> &'static str {
        match self {
            ObjectKind::Image { .. } => "image",
            ObjectKind::Slab { .. } => "slab",
            ObjectKind::SlabImage { .. } => "slab-image",
        }
    }
}

pub(crate) struct OpenObject {
    pub cookie: String,
    pub file: Arc<dyn ObjectFile>,
    pub kind: ObjectKind,
}

/// Open object as shown by the debug surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenObjectInfo {
    pub object_id: u32,
    pub cookie: String,
    pub kind: String,
}

pub struct CacheServer {
    config: ServerConfig,
    device: Arc<dyn CacheDevice>,
    store: SledStore,
    allocator: Arc<SlabAllocator>,
    resolver: ManifestResolver,
    builder: Arc<ImageBuilder>,
    upstream: Arc<dyn Upstream>,
    mounter: Arc<dyn Mounter>,
    objects: Mutex<HashMap<u32, Arc<OpenObject>>>,
    fetches: SingleFlight<Digest, u64>,
    slab_mounts: Arc<Mutex<HashMap<SlabId, PathBuf>>>,
}

impl CacheServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        device: Arc<dyn CacheDevice>,
        store: SledStore,
        allocator: Arc<SlabAllocator>,
        resolver: ManifestResolver,
        upstream: Arc<dyn Upstream>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let builder = Arc::new(ImageBuilder::new(config.block_shift, config.params.clone()));
        Self {
            config,
            device,
            store,
            allocator,
            resolver,
            builder,
            upstream,
            mounter,
            objects: Mutex::new(HashMap::new()),
            fetches: SingleFlight::new(),
            slab_mounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn insert_object(&self, object_id: u32, object: OpenObject) {
        debug!(object_id, cookie = %object.cookie, kind = object.kind.name(), "Object opened");
        let previous = self.objects.lock().insert(object_id, Arc::new(object));
        if previous.is_some() {
            tracing::warn!(object_id, "Replaced an object that was never closed");
        }
    }

    fn object(&self, object_id: u32) -> Option<Arc<OpenObject>> {
        self.objects.lock().get(&object_id).cloned()
    }

    pub fn open_objects(&self) -> Vec<OpenObjectInfo> {
        let mut out: Vec<OpenObjectInfo> = self
            .objects
            .lock()
            .iter()
            .map(|(id, obj)| OpenObjectInfo {
                object_id: *id,
                cookie: obj.cookie.clone(),
                kind: obj.kind.name().to_string(),
            })
            .collect();
        out.sort_by_key(|o| o.object_id);
        out
    }

    /// Drop every open object, closing its descriptor.
    pub fn close_all_objects(&self) {
        let drained: Vec<_> = self.objects.lock().drain().collect();
        info!(count = drained.len(), "Closed open objects");
    }
}

#[async_trait]
impl MessageHandler for CacheServer {
    async fn handle(&self, msg: Message) -> Result<(), DaemonError> {
        match msg {
            Message::Open {
                msg_id,
                object_id,
                fd,
                volume_key,
                cookie_key,
                ..
            } => self.handle_open(msg_id, object_id, fd, &volume_key, &cookie_key).await,
            Message::Close { object_id, .. } => self.handle_close(object_id).await,
            Message::Read {
                msg_id,
                object_id,
                off,
                len,
            } => self.handle_read(msg_id, object_id, off, len).await,
        }
    }
}
