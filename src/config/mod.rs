//! Layered configuration: built-in defaults, then an optional
//! `config/default.{toml,yaml,json}` file, then `SERVICEBUS_*` environment
//! variables (a `.env` file is honoured). Nested keys use `__`, e.g.
//! `SERVICEBUS_BUS__TICK_INTERVAL_MS=250`.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BusSettings, GatewaySettings, LoggingSettings, PersistenceBackend, PersistenceSettings,
    Settings,
};

const DEFAULT_FILE: &str = "config/default";
const ENV_PREFIX: &str = "SERVICEBUS";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_FILE)
}

/// Like [`load_config`], reading the optional file at `path` (extension is
/// inferred by the `config` crate).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_into(Settings::default()))
}
