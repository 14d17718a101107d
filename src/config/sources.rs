//! Configuration source layering: defaults, TOML file, environment.

use std::path::PathBuf;

use config::{Environment, File, FileFormat};

use super::models::Config;

const DEFAULT_CONFIG_PATH: &str = "config/mediaq.toml";
const CONFIG_PATH_VAR: &str = "MEDIAQ_CONFIG";
const ENV_PREFIX: &str = "MEDIAQ";

pub fn load() -> Result<Config, config::ConfigError> {
    let path = std::env::var(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from_sources(path)
}

pub fn load_from_sources(path: PathBuf) -> Result<Config, config::ConfigError> {
    let builder = config::Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
