//! Defaults seeded into every builder before any source is layered on.

use crate::config::DaemonConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat};

/// Builder with `DaemonConfig::default()` as the lowest-precedence source.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = serde_json::to_string(&DaemonConfig::default())
        .map_err(|e| ConfigError::Message(format!("Failed to encode defaults: {}", e)))?;
    Ok(Config::builder().add_source(File::from_str(&defaults, FileFormat::Json)))
}
