//! Environment variable source: CACHEFSD_ prefix with __ separator

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

/// Add environment variable overlay to builder.
/// `CACHEFSD__PARAMS__CHUNK_SHIFT=18` sets `params.chunk_shift`.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(builder.add_source(
        Environment::with_prefix("CACHEFSD")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("public_keys")
            .try_parsing(true),
    ))
}
