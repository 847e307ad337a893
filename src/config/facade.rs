//! ConfigLoader facade delegating to merge service.

use super::merge::service::MergeService;
use super::DaemonConfig;
use crate::error::DaemonError;
use std::path::Path;

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults and environment only.
    pub fn load() -> Result<DaemonConfig, DaemonError> {
        let config = MergeService::load(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file with environment overlay.
    pub fn load_from_file(path: &Path) -> Result<DaemonConfig, DaemonError> {
        let config = MergeService::load(Some(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Create default configuration.
    pub fn default() -> DaemonConfig {
        DaemonConfig::default()
    }
}
