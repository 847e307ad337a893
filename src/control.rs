//! Local control API
//!
//! JSON lines over a Unix socket: a client connects, sends one request line,
//! reads one response line and disconnects. Every response uses the same
//! envelope, `{ "success", "error"?, "data"? }`.

use crate::error::{DaemonError, ErrorKind};
use crate::mount::{MountManager, MountRequest};
use crate::server::{CacheServer, OpenObjectInfo};
use crate::slab::{ChunkSummary, SlabAllocator};
use crate::store::{ImageRecord, ImageRecordStore, MountState, SledStore};
use crate::types::{GlobalParams, SlabId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest request line the listener reads.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Mount {
        tree_path: String,
        upstream: String,
        mount_point: String,
    },
    Unmount {
        tree_path: String,
    },
    Gc {},
    Debug {
        #[serde(default)]
        include_images: bool,
        #[serde(default)]
        include_chunks: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(e: &DaemonError) -> Self {
        Self {
            success: false,
            error: Some(ControlErrorBody {
                kind: e.kind(),
                message: e.to_string(),
            }),
            data: None,
        }
    }

    /// Decode the data payload of a successful response.
    pub fn into_data<T: serde::de::DeserializeOwned>(self) -> Result<T, DaemonError> {
        if let Some(err) = self.error {
            return Err(remote_error(err));
        }
        let data = self.data.unwrap_or(Value::Null);
        serde_json::from_value(data)
            .map_err(|e| DaemonError::Protocol(format!("unexpected control response: {}", e)))
    }
}

fn remote_error(err: ControlErrorBody) -> DaemonError {
    match err.kind {
        ErrorKind::NotFound => DaemonError::NotFound(err.message),
        ErrorKind::Conflict => DaemonError::Conflict(err.message),
        ErrorKind::InvalidRequest => DaemonError::InvalidRequest(err.message),
        ErrorKind::Verification => DaemonError::Verification(err.message),
        ErrorKind::ExternalFetch => DaemonError::ExternalFetch(err.message),
        ErrorKind::Protocol => DaemonError::Protocol(err.message),
        ErrorKind::Config => DaemonError::ConfigError(err.message),
        ErrorKind::Storage | ErrorKind::Fault => DaemonError::Fault(err.message),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub images_removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabUsage {
    pub slab_id: SlabId,
    pub next_addr: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugReport {
    pub params: GlobalParams,
    pub block_shift: u32,
    pub chunk_count: usize,
    pub slabs: Vec<SlabUsage>,
    pub open_objects: Vec<OpenObjectInfo>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub chunks: Vec<ChunkSummary>,
}

/// Executes control requests against the daemon's components.
pub struct ControlService {
    mounts: Arc<MountManager>,
    store: SledStore,
    allocator: Arc<SlabAllocator>,
    server: Option<Arc<CacheServer>>,
}

impl ControlService {
    pub fn new(
        mounts: Arc<MountManager>,
        store: SledStore,
        allocator: Arc<SlabAllocator>,
        server: Option<Arc<CacheServer>>,
    ) -> Self {
        Self {
            mounts,
            store,
            allocator,
            server,
        }
    }

    /// Run one request. Mounts and store scans block, so they run off the
    /// async workers.
    pub async fn execute(self: &Arc<Self>, request: ControlRequest) -> ControlResponse {
        let this = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || this.execute_blocking(request))
            .await
            .unwrap_or_else(|e| Err(DaemonError::Fault(format!("control task: {}", e))));
        match result {
            Ok(data) => ControlResponse::ok(data),
            Err(e) => {
                warn!(kind = ?e.kind(), error = %e, "Control request failed");
                ControlResponse::err(&e)
            }
        }
    }

    fn execute_blocking(&self, request: ControlRequest) -> Result<Value, DaemonError> {
        match request {
            ControlRequest::Mount {
                tree_path,
                upstream,
                mount_point,
            } => {
                let record = self.mounts.request_mount(&MountRequest {
                    tree_path,
                    upstream,
                    mount_point,
                })?;
                to_value(&record)
            }
            ControlRequest::Unmount { tree_path } => to_value(&self.mounts.request_unmount(&tree_path)?),
            ControlRequest::Gc {} => to_value(&self.gc()?),
            ControlRequest::Debug {
                include_images,
                include_chunks,
            } => to_value(&self.debug(include_images, include_chunks)?),
        }
    }

    /// Forget unmounted trees and their cached manifests. Chunk records and
    /// slab addresses stay: cached images and slab objects still point at them.
    pub fn gc(&self) -> Result<GcReport, DaemonError> {
        let mut report = GcReport::default();
        for record in self.store.list_images()? {
            if record.mount_state == MountState::Unmounted {
                self.store.delete_image(&record.tree_hash)?;
                report.images_removed.push(record.tree_hash);
            }
        }
        info!(images_removed = report.images_removed.len(), "Garbage collected");
        Ok(report)
    }

    pub fn debug(&self, include_images: bool, include_chunks: bool) -> Result<DebugReport, DaemonError> {
        let slabs = self
            .allocator
            .slab_sequences()?
            .into_iter()
            .map(|(slab_id, next_addr)| SlabUsage { slab_id, next_addr })
            .collect();
        Ok(DebugReport {
            params: self.store.params().clone(),
            block_shift: self.allocator.block_shift().0,
            chunk_count: self.store.chunk_count(),
            slabs,
            open_objects: self.server.as_ref().map(|s| s.open_objects()).unwrap_or_default(),
            images: if include_images {
                self.store.list_images()?
            } else {
                Vec::new()
            },
            chunks: if include_chunks {
                self.allocator.list_chunks()?
            } else {
                Vec::new()
            },
        })
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, DaemonError> {
    serde_json::to_value(v).map_err(|e| DaemonError::Fault(format!("encoding control response: {}", e)))
}

/// Accept loop for the control socket.
pub struct ControlListener {
    path: PathBuf,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlListener {
    /// Bind `socket_path` (replacing a stale socket) and start accepting.
    pub async fn start(service: Arc<ControlService>, socket_path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if socket_path.exists() {
            tokio::fs::remove_file(socket_path).await?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Control socket listening");

        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let service = Arc::clone(&service);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(service, stream).await {
                                    debug!(error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Control accept error"),
                    },
                }
            }
        });
        Ok(Self {
            path: socket_path.to_path_buf(),
            stop,
            task,
        })
    }

    /// Stop accepting connections and remove the socket.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Control listener task failed");
        }
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(error = %e, "Removing control socket");
        }
        info!("Control socket closed");
    }
}

async fn handle_connection(service: Arc<ControlService>, stream: UnixStream) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    let oversized = read as u64 >= MAX_REQUEST_BYTES && !line.ends_with('\n');
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let response = if oversized {
        ControlResponse::err(&DaemonError::InvalidRequest(format!(
            "request exceeds {} bytes",
            MAX_REQUEST_BYTES
        )))
    } else {
        match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => {
                debug!(?request, "Control request");
                service.execute(request).await
            }
            Err(e) => ControlResponse::err(&DaemonError::InvalidRequest(format!("invalid request: {}", e))),
        }
    };
    let mut out = to_line(&response)?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn to_line<T: Serialize>(v: &T) -> Result<String, DaemonError> {
    serde_json::to_string(v).map_err(|e| DaemonError::Fault(format!("encoding control message: {}", e)))
}

/// Client side of the control socket.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, DaemonError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            DaemonError::ConfigError(format!(
                "cannot reach daemon at {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let (reader, mut writer) = stream.into_split();
        let mut out = to_line(request)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;
        serde_json::from_str(line.trim())
            .map_err(|e| DaemonError::Protocol(format!("invalid control response: {}", e)))
    }
}
