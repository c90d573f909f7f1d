mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};

use settings::PartialSettings;

pub use settings::{BrokerSettings, ClientSettings, LogSettings, ServerSettings, Settings};

const ENV_PREFIX: &str = "PUBWIRE";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Loads the configuration, layering sources in increasing priority:
/// `config/default`, the explicit `path`, then `PUBWIRE__SECTION__KEY`
/// environment variables. Anything left unset comes from `Settings::default()`.
///
/// A `path` ending in `.conf` or with no extension is read as flat
/// key=value lines (`IP=...`, `PORT=...`).
pub fn load_config_from(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        let name = path.to_string_lossy();
        builder = match path.extension().and_then(|e| e.to_str()) {
            None | Some("conf") => builder.add_source(File::new(&name, FileFormat::Ini)),
            Some(_) => builder.add_source(File::with_name(&name)),
        };
    }

    let builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available, then merge with defaults
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
