//! Kernel bridge
//!
//! A dedicated poller thread waits on the device with a bounded timeout, drains
//! every pending message and hands the raw buffers to a pool of async workers.
//! Workers decode and dispatch to the `MessageHandler`. A malformed message or
//! a failing handler is logged and never stops the pool.

use super::device::{CacheDevice, PollOutcome};
use super::wire::{Command, Message, MAX_MSG_SIZE};
use crate::error::DaemonError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive device errors tolerated before the poller starts backing off.
const ERROR_BACKOFF_THRESHOLD: u32 = 10;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Message) -> Result<(), DaemonError>;
}

/// Bridge tuning
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub workers: usize,
    pub poll_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            poll_timeout: Duration::from_secs(1),
            queue_depth: 256,
        }
    }
}

/// Bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub malformed: u64,
    pub handled: u64,
    pub failed: u64,
    pub faults: u64,
}

/// Announce the cache directory and tag, then bind in on-demand mode.
pub fn register(device: &dyn CacheDevice, cache_path: &Path, tag: &str) -> Result<(), DaemonError> {
    for cmd in [
        Command::Dir(cache_path.display().to_string()),
        Command::Tag(tag.to_string()),
        Command::BindOndemand,
    ] {
        device.write_command(&cmd)?;
    }
    info!(cache = %cache_path.display(), tag = %tag, "Bound cachefiles in on-demand mode");
    Ok(())
}

pub struct KernelBridge {
    device: Arc<dyn CacheDevice>,
    handler: Arc<dyn MessageHandler>,
    config: BridgeConfig,
    stats: Arc<RwLock<BridgeStats>>,
    poller: Mutex<Option<std::thread::JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl KernelBridge {
    pub fn new(device: Arc<dyn CacheDevice>, handler: Arc<dyn MessageHandler>, config: BridgeConfig) -> Self {
        Self {
            device,
            handler,
            config,
            stats: Arc::new(RwLock::new(BridgeStats::default())),
            poller: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the poller thread and worker pool. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), DaemonError> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.config.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.workers.max(1) {
            let rx = rx.clone();
            let handler = self.handler.clone();
            let stats = self.stats.clone();
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, rx, handler, stats).await;
            }));
        }

        let device = self.device.clone();
        let timeout = self.config.poll_timeout;
        let stats = self.stats.clone();
        let handle = std::thread::Builder::new()
            .name("cachefiles-poll".to_string())
            .spawn(move || Self::poll_loop(device, tx, timeout, stats))?;
        *poller = Some(handle);

        info!(workers = workers.len(), "Started kernel bridge");
        Ok(())
    }

    /// Close the device, wait for the poller to observe it, then drain workers.
    pub async fn stop(&self) {
        self.device.close();
        let poller = self.poller.lock().take();
        if let Some(handle) = poller {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Kernel poller did not exit cleanly");
            }
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
        info!("Stopped kernel bridge");
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.read().clone()
    }

    fn poll_loop(
        device: Arc<dyn CacheDevice>,
        tx: mpsc::Sender<Vec<u8>>,
        timeout: Duration,
        stats: Arc<RwLock<BridgeStats>>,
    ) {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let mut errors = 0u32;
        let backoff = |errors: &mut u32| {
            *errors += 1;
            if *errors > ERROR_BACKOFF_THRESHOLD {
                std::thread::sleep(ERROR_BACKOFF);
            }
        };

        loop {
            match device.poll_readable(timeout) {
                Ok(PollOutcome::Closed) => break,
                Ok(PollOutcome::Timeout) => continue,
                Ok(PollOutcome::Ready) => {}
                Err(e) => {
                    warn!(error = %e, "Device poll failed");
                    backoff(&mut errors);
                    continue;
                }
            }
            // drain everything pending before polling again
            loop {
                match device.read_message(&mut buf) {
                    Ok(Some(n)) => {
                        errors = 0;
                        stats.write().received += 1;
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            debug!("Worker pool gone; poller exiting");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Device read failed");
                        backoff(&mut errors);
                        break;
                    }
                }
            }
        }
        debug!("Device closed; poller exiting");
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<RwLock<BridgeStats>>,
    ) {
        debug!(worker_id, "Worker started");
        loop {
            let buf = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(buf) = buf else {
                break;
            };
            Self::dispatch(handler.as_ref(), &buf, &stats).await;
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn dispatch(handler: &dyn MessageHandler, buf: &[u8], stats: &RwLock<BridgeStats>) {
        let msg = match Message::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = buf.len(), "Dropping malformed kernel message");
                stats.write().malformed += 1;
                return;
            }
        };
        let msg_id = msg.msg_id();
        let object_id = msg.object_id();
        match AssertUnwindSafe(handler.handle(msg)).catch_unwind().await {
            Ok(Ok(())) => stats.write().handled += 1,
            Ok(Err(e)) => {
                warn!(msg_id, object_id, kind = ?e.kind(), error = %e, "Kernel message failed");
                stats.write().failed += 1;
            }
            Err(_) => {
                error!(msg_id, object_id, "Kernel message handler panicked");
                stats.write().faults += 1;
            }
        }
    }
}
