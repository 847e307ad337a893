//! MergeService: orchestrates sources, applies merge policy, deserializes to DaemonConfig.

use crate::config::sources::{environment, file};
use crate::config::DaemonConfig;
use config::ConfigError;
use std::path::Path;

use super::merge_policy;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Precedence: defaults (lowest) -> config file -> environment (highest).
    pub fn load(config_file: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = match config_file {
            Some(path) => file::add_to_builder(builder, path)?,
            None => builder,
        };
        let builder = environment::add_to_builder(builder)?;

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut tmp = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            tmp,
            "upstream = \"https://cache.example.org\"\nworkers = 4\n\n[params]\nchunk_shift = 18\ndigest_algo = \"sha256\"\ndigest_bits = 192"
        )
        .unwrap();

        let config = MergeService::load(Some(tmp.path())).unwrap();
        assert_eq!(config.upstream, "https://cache.example.org");
        assert_eq!(config.workers, 4);
        assert_eq!(config.params.chunk_shift, 18);
        assert_eq!(config.block_shift, 12);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = MergeService::load(None).unwrap();
        assert_eq!(config.dev_path, std::path::PathBuf::from("/dev/cachefiles"));
        assert_eq!(config.params.digest_bits, 192);
    }
}
