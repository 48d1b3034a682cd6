//! Loading [`ConnectionOptions`] from a file and the environment.
//!
//! Sources are applied in order, later ones overriding earlier ones:
//!  1. an optional file (format taken from its extension: yaml, toml or json)
//!  2. environment variables named `{PREFIX}__{OPTION}`,
//!     e.g. `MESSAGING__RETRY_WAIT_IN_MS=250`
//!
//! The merged options are validated before they are returned.

use crate::connection::ConnectionOptions;
use crate::error::ConfigurationError;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::{debug, info};

/// Environment prefix used when the caller has no preference
pub const DEFAULT_ENV_PREFIX: &str = "MESSAGING";

/// Build validated connection options from `path` and `{env_prefix}__*`
/// environment variables
pub fn load_options(
    path: Option<&Path>,
    env_prefix: &str,
) -> Result<ConnectionOptions, ConfigurationError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        debug!(path = %path.display(), "Loading connection options from file");
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigurationError::Parsing {
            message: e.to_string(),
        })?;

    let options: ConnectionOptions =
        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;
    options.validate()?;

    info!(
        connection = %options.connection_name(),
        entity_type = %options.entity_type,
        "Connection options loaded"
    );
    Ok(options)
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
