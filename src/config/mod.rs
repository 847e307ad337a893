//! Daemon configuration
//!
//! `DaemonConfig` is assembled by `ConfigLoader` from built-in defaults, an
//! optional TOML file and `CACHEFSD__*` environment variables, in that order.

pub mod facade;
pub mod merge;
pub mod sources;

pub use facade::ConfigLoader;

use crate::error::DaemonError;
use crate::logging::LoggingConfig;
use crate::types::{BlockShift, GlobalParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_dev_path() -> PathBuf {
    PathBuf::from("/dev/cachefiles")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/cachefsd")
}

fn default_cache_tag() -> String {
    "cachefsd".to_string()
}

fn default_domain_id() -> String {
    "cachefsd".to_string()
}

fn default_block_shift() -> u32 {
    12
}

fn default_small_file_cutoff() -> u64 {
    224
}

fn default_workers() -> usize {
    16
}

fn default_manifest_fetch_parallelism() -> usize {
    20
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Kernel cachefiles device node
    #[serde(default = "default_dev_path")]
    pub dev_path: PathBuf,

    /// Cache directory handed to the kernel; also holds the database and control socket
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Cache tag registered with the kernel
    #[serde(default = "default_cache_tag")]
    pub cache_tag: String,

    /// erofs domain id shared by all images
    #[serde(default = "default_domain_id")]
    pub domain_id: String,

    /// Upstream used for images whose record does not name one
    #[serde(default)]
    pub upstream: String,

    /// Manifest service endpoint
    #[serde(default)]
    pub manifester_url: String,

    /// Chunk read endpoint (digest appended as the final path component)
    #[serde(default)]
    pub chunk_read_url: String,

    /// Remote manifest cache endpoint (cache key appended)
    #[serde(default)]
    pub manifest_cache_url: String,

    /// Global chunking/digest parameters
    #[serde(default)]
    pub params: GlobalParams,

    /// Image block size exponent
    #[serde(default = "default_block_shift")]
    pub block_shift: u32,

    /// Files at or below this size are requested inline in manifests
    #[serde(default = "default_small_file_cutoff")]
    pub small_file_cutoff: u64,

    /// Worker pool size for kernel messages
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent chunk fetches when reassembling a chunked manifest
    #[serde(default = "default_manifest_fetch_parallelism")]
    pub manifest_fetch_parallelism: usize,

    /// Upper bound on a single device poll
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Trusted manifest signing keys, `name:base64`
    #[serde(default)]
    pub public_keys: Vec<String>,

    /// Mount a synthetic image of each slab when the slab is opened
    #[serde(default)]
    pub mount_slab_images: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dev_path: default_dev_path(),
            cache_path: default_cache_path(),
            cache_tag: default_cache_tag(),
            domain_id: default_domain_id(),
            upstream: String::new(),
            manifester_url: String::new(),
            chunk_read_url: String::new(),
            manifest_cache_url: String::new(),
            params: GlobalParams::default(),
            block_shift: default_block_shift(),
            small_file_cutoff: default_small_file_cutoff(),
            workers: default_workers(),
            manifest_fetch_parallelism: default_manifest_fetch_parallelism(),
            poll_timeout_ms: default_poll_timeout_ms(),
            public_keys: Vec::new(),
            mount_slab_images: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Reject parameter combinations that would produce unusable images.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if !(9..=16).contains(&self.block_shift) {
            return Err(DaemonError::ConfigError(format!(
                "block_shift {} out of range 9..=16",
                self.block_shift
            )));
        }
        if self.params.chunk_shift < self.block_shift || self.params.chunk_shift > 31 {
            return Err(DaemonError::ConfigError(format!(
                "chunk_shift {} must be between block_shift {} and 31",
                self.params.chunk_shift, self.block_shift
            )));
        }
        if self.params.digest_bits == 0
            || self.params.digest_bits % 8 != 0
            || self.params.digest_bits > 256
        {
            return Err(DaemonError::ConfigError(format!(
                "digest_bits {} must be a non-zero multiple of 8 up to 256",
                self.params.digest_bits
            )));
        }
        if self.params.digest_algo != "sha256" {
            return Err(DaemonError::ConfigError(format!(
                "unsupported digest_algo {}",
                self.params.digest_algo
            )));
        }
        if self.workers == 0 || self.manifest_fetch_parallelism == 0 {
            return Err(DaemonError::ConfigError(
                "workers and manifest_fetch_parallelism must be non-zero".to_string(),
            ));
        }
        if !self.cache_path.is_absolute() {
            return Err(DaemonError::ConfigError(format!(
                "cache_path {} must be absolute",
                self.cache_path.display()
            )));
        }
        Ok(())
    }

    pub fn block_shift(&self) -> BlockShift {
        BlockShift(self.block_shift)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_path.join("cachefsd.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.cache_path.join("control.sock")
    }

    pub fn slab_mount_dir(&self) -> PathBuf {
        self.cache_path.join("slabs")
    }
}
