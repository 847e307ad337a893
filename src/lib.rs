//! cachefsd: on-demand tree delivery through the kernel cachefiles facility
//!
//! Trees are described by signed manifests. Opening a tree builds an EROFS
//! image whose file data points into large virtual slabs; slab bytes are
//! fetched chunk by chunk from an upstream binary cache only when the kernel
//! reads them.

pub mod concurrency;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod image;
pub mod kernel;
pub mod logging;
pub mod manifest;
pub mod mount;
pub mod server;
pub mod singleflight;
pub mod slab;
pub mod store;
pub mod tooling;
pub mod types;
pub mod upstream;
