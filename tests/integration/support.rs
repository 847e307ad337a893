//! In-memory stand-ins for the kernel device, object descriptors, upstream and mounter.

use async_trait::async_trait;
use cachefsd::error::DaemonError;
use cachefsd::kernel::{CacheDevice, Command, Message, ObjectFile, PollOutcome};
use cachefsd::manifest::ManifestRequest;
use cachefsd::mount::Mounter;
use cachefsd::upstream::Upstream;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kernel device fed by the test through `push`.
#[derive(Default)]
pub struct FakeDevice {
    pending: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    pub commands: Mutex<Vec<Command>>,
    pub files: Mutex<HashMap<u32, Arc<MemFile>>>,
    closed: AtomicBool,
}

impl FakeDevice {
    pub fn push(&self, msg: Message) {
        self.pending.lock().push_back(msg.encode());
        self.ready.notify_all();
    }

    pub fn file(&self, fd: u32) -> Arc<MemFile> {
        self.files.lock().entry(fd).or_default().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn copen_for(&self, msg_id: u32) -> Option<i64> {
        self.commands.lock().iter().find_map(|c| match c {
            Command::Copen { msg_id: id, size } if *id == msg_id => Some(*size),
            _ => None,
        })
    }
}

impl CacheDevice for FakeDevice {
    fn write_command(&self, cmd: &Command) -> Result<(), DaemonError> {
        self.commands.lock().push(cmd.clone());
        Ok(())
    }

    fn poll_readable(&self, timeout: Duration) -> Result<PollOutcome, DaemonError> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Ok(PollOutcome::Closed);
        }
        if pending.is_empty() {
            self.ready.wait_for(&mut pending, timeout.min(Duration::from_millis(20)));
        }
        if self.is_closed() {
            return Ok(PollOutcome::Closed);
        }
        if pending.is_empty() {
            Ok(PollOutcome::Timeout)
        } else {
            Ok(PollOutcome::Ready)
        }
    }

    fn read_message(&self, buf: &mut [u8]) -> Result<Option<usize>, DaemonError> {
        match self.pending.lock().pop_front() {
            Some(msg) => {
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(Some(msg.len()))
            }
            None => Ok(None),
        }
    }

    fn object_file(&self, fd: u32) -> Result<Arc<dyn ObjectFile>, DaemonError> {
        Ok(self.file(fd))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

/// Object descriptor recording writes and read completions.
#[derive(Default)]
pub struct MemFile {
    pub writes: Mutex<Vec<(u64, Vec<u8>)>>,
    pub completions: Mutex<Vec<u32>>,
}

impl ObjectFile for MemFile {
    fn write_at(&self, data: &[u8], off: u64) -> Result<(), DaemonError> {
        self.writes.lock().push((off, data.to_vec()));
        Ok(())
    }

    fn complete_read(&self, msg_id: u32) -> Result<(), DaemonError> {
        self.completions.lock().push(msg_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUpstream {
    pub envelope: Mutex<Option<Vec<u8>>>,
    pub chunks: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    pub chunk_fetches: AtomicUsize,
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn request_manifest(&self, _req: &ManifestRequest) -> Result<Vec<u8>, DaemonError> {
        self.envelope
            .lock()
            .clone()
            .ok_or_else(|| DaemonError::ExternalFetch("no manifest".to_string()))
    }

    async fn fetch_cached_manifest(&self, key: &str) -> Result<Vec<u8>, DaemonError> {
        Err(DaemonError::NotFound(key.to_string()))
    }

    async fn fetch_chunk(&self, digest: &[u8]) -> Result<Vec<u8>, DaemonError> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        self.chunks
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound("chunk".to_string()))
    }
}

/// Mounter keeping a simulated mount table.
#[derive(Default)]
pub struct FakeMounter {
    pub mounted: Mutex<HashSet<PathBuf>>,
    pub mount_calls: Mutex<Vec<(String, PathBuf)>>,
}

impl Mounter for FakeMounter {
    fn mount(&self, fsid: &str, mount_point: &Path) -> Result<(), DaemonError> {
        self.mount_calls.lock().push((fsid.to_string(), mount_point.to_path_buf()));
        self.mounted.lock().insert(mount_point.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), DaemonError> {
        if !self.mounted.lock().remove(mount_point) {
            return Err(DaemonError::NotFound(format!("{} not mounted", mount_point.display())));
        }
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> Result<bool, DaemonError> {
        Ok(self.mounted.lock().contains(mount_point))
    }
}

/// Poll `cond` until it holds or roughly two seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
