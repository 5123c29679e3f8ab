mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LoggingSettings, PersistenceBackend, PersistenceSettings, Settings,
};

/// Prefix for environment overrides, e.g. `RELAYMQ__BROKER__DEFAULT_PREFETCH=10`.
pub const ENV_PREFIX: &str = "RELAYMQ";

/// Loads the configuration from `.env`, the optional `config/default` file
/// and `RELAYMQ__*` environment variables, then fills anything missing from
/// `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_onto(Settings::default()))
}

#[cfg(test)]
mod tests;
