//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `config/default.{toml,yaml,json,...}` file, then `POPMQ_*` environment
//! variables with `__` between nesting levels (`POPMQ_CONSUMER__GROUP_NAME`).

mod settings;

use std::path::Path;

use config::{Config, Environment, File};

pub use settings::{
    ConsumerSettings, DEFAULT_BROKER_ADDRESS, DEFAULT_GROUP_NAME, LogSettings, PartialSettings, PullSettings,
    Settings,
};

use crate::utils::Result;

pub const ENV_PREFIX: &str = "POPMQ";

/// Loads the configuration from `config/default` under the working
/// directory and the environment, merged over the defaults.
pub fn load_config() -> Result<Settings> {
    load_config_from(Path::new("config/default"))
}

/// Same as [`load_config`] with an explicit file stem; the file is optional.
pub fn load_config_from(file: &Path) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::from(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    Settings::merge(partial)
}
