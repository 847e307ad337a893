//! Daemon lifecycle
//!
//! Wires the store, allocator, resolver, cache server, kernel bridge, mount
//! manager and control listener together. External capabilities (the kernel
//! device, upstream and mounter) are passed in, so the whole daemon runs
//! against fakes in tests.

use crate::config::DaemonConfig;
use crate::control::{ControlListener, ControlService};
use crate::error::DaemonError;
use crate::kernel::{register, BridgeConfig, CacheDevice, DevCacheFiles, KernelBridge};
use crate::manifest::{ManifestResolver, TrustedKeys};
use crate::mount::{MountManager, Mounter, ReconcileReport, SystemMounter};
use crate::server::{CacheServer, ServerConfig};
use crate::slab::SlabAllocator;
use crate::store::SledStore;
use crate::upstream::{HttpUpstream, Upstream};
use std::sync::Arc;
use tracing::{info, warn};

/// External capabilities the daemon runs against.
pub struct DaemonDeps {
    pub device: Arc<dyn CacheDevice>,
    pub upstream: Arc<dyn Upstream>,
    pub mounter: Arc<dyn Mounter>,
}

impl DaemonDeps {
    /// The real kernel device, HTTP upstream and mount(8).
    pub fn system(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let device = DevCacheFiles::open(&config.dev_path)?;
        let upstream = HttpUpstream::new(
            &config.manifester_url,
            &config.chunk_read_url,
            &config.manifest_cache_url,
        )?;
        Ok(Self {
            device: Arc::new(device),
            upstream: Arc::new(upstream),
            mounter: Arc::new(SystemMounter::new(&config.domain_id)),
        })
    }
}

pub struct Daemon {
    store: SledStore,
    server: Arc<CacheServer>,
    bridge: KernelBridge,
    mounts: Arc<MountManager>,
    control: Option<ControlListener>,
    reconcile: ReconcileReport,
}

impl Daemon {
    /// Open the store, bind the cache, start serving and reconcile mounts.
    pub async fn start(config: DaemonConfig, deps: DaemonDeps) -> Result<Self, DaemonError> {
        tokio::fs::create_dir_all(&config.cache_path).await?;
        let store = SledStore::open(&config.db_path(), &config.params)?;
        let allocator = Arc::new(SlabAllocator::new(store.clone(), config.block_shift()));

        let keys = TrustedKeys::parse(&config.public_keys)?;
        if keys.is_empty() {
            warn!("No trusted manifest keys configured; every image open will fail");
        }
        let resolver = ManifestResolver::new(
            store.clone(),
            deps.upstream.clone(),
            keys,
            config.params.clone(),
            config.small_file_cutoff,
            config.manifest_fetch_parallelism,
        );
        let server = Arc::new(CacheServer::new(
            ServerConfig::from_daemon(&config),
            deps.device.clone(),
            store.clone(),
            allocator.clone(),
            resolver,
            deps.upstream.clone(),
            deps.mounter.clone(),
        ));

        register(deps.device.as_ref(), &config.cache_path, &config.cache_tag)?;
        let bridge = KernelBridge::new(
            deps.device.clone(),
            server.clone(),
            BridgeConfig {
                workers: config.workers,
                poll_timeout: config.poll_timeout(),
                ..BridgeConfig::default()
            },
        );
        bridge.start()?;

        let mounts = Arc::new(MountManager::new(Arc::new(store.clone()), deps.mounter.clone()));
        let service = Arc::new(ControlService::new(
            mounts.clone(),
            store.clone(),
            allocator,
            Some(server.clone()),
        ));
        let control = ControlListener::start(service, &config.socket_path()).await?;

        // mounts trigger OPENs, so the bridge must already be serving
        let m = mounts.clone();
        let reconcile = tokio::task::spawn_blocking(move || m.reconcile())
            .await
            .map_err(|e| DaemonError::Fault(format!("reconcile task: {}", e)))??;

        info!(cache = %config.cache_path.display(), domain = %config.domain_id, "Daemon started");
        Ok(Self {
            store,
            server,
            bridge,
            mounts,
            control: Some(control),
            reconcile,
        })
    }

    pub fn mounts(&self) -> Arc<MountManager> {
        self.mounts.clone()
    }

    pub fn server(&self) -> Arc<CacheServer> {
        self.server.clone()
    }

    /// What startup reconciliation did.
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.reconcile
    }

    /// Stop control, close objects, stop the bridge, flush the store.
    pub async fn shutdown(mut self) -> Result<(), DaemonError> {
        if let Some(control) = self.control.take() {
            control.stop().await;
        }
        self.server.close_all_objects();
        self.bridge.stop().await;
        self.store.flush().await?;
        info!("Daemon stopped");
        Ok(())
    }

    /// Serve until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(self) -> Result<(), DaemonError> {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = term.recv() => {}
        }
        info!("Shutdown requested");
        self.shutdown().await
    }
}
