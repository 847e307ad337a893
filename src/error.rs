//! Error types
//!
//! `StorageError` covers the persisted store. `DaemonError` is what crosses every
//! component boundary; its `kind()` collapses it to the closed `ErrorKind` set
//! that handlers use to pick a reply.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Persisted-store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("mismatched global params; wipe cache and start over (stored {stored}, configured {configured})")]
    ParamsMismatch { stored: String, configured: String },

    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Closed error-kind enumeration surfaced at each boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed kernel message.
    Protocol,
    /// Missing chunk, digest, image or record.
    NotFound,
    /// Signature, digest or parameter mismatch.
    Verification,
    /// Persisted-store transaction failure.
    Storage,
    /// Upstream unreachable or bad status.
    ExternalFetch,
    /// Request conflicts with current state.
    Conflict,
    /// Request failed validation.
    InvalidRequest,
    /// Configuration or environment setup failure.
    Config,
    /// Unexpected fault caught at a handler boundary.
    Fault,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("upstream fetch failed: {0}")]
    ExternalFetch(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handler fault: {0}")]
    Fault(String),

    /// Error produced once and handed to every single-flight waiter.
    #[error(transparent)]
    Shared(Arc<DaemonError>),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Protocol(_) => ErrorKind::Protocol,
            DaemonError::NotFound(_) => ErrorKind::NotFound,
            DaemonError::Verification(_) => ErrorKind::Verification,
            DaemonError::Storage(StorageError::ParamsMismatch { .. }) => ErrorKind::Verification,
            DaemonError::Storage(_) => ErrorKind::Storage,
            DaemonError::ExternalFetch(_) => ErrorKind::ExternalFetch,
            DaemonError::Conflict(_) => ErrorKind::Conflict,
            DaemonError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            DaemonError::ConfigError(_) => ErrorKind::Config,
            DaemonError::Io(_) => ErrorKind::Storage,
            DaemonError::Fault(_) => ErrorKind::Fault,
            DaemonError::Shared(inner) => inner.kind(),
        }
    }
}

impl From<sled::Error> for DaemonError {
    fn from(e: sled::Error) -> Self {
        DaemonError::Storage(StorageError::Sled(e))
    }
}

impl From<bincode::Error> for DaemonError {
    fn from(e: bincode::Error) -> Self {
        DaemonError::Storage(StorageError::Encoding(e))
    }
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::ConfigError(e.to_string())
    }
}

impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        DaemonError::ExternalFetch(e.to_string())
    }
}
