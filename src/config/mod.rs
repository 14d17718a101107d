//! Bootstrap configuration for mediaq.
//!
//! Layered loading, highest priority first:
//! 1. Environment variables (`MEDIAQ__<section>__<key>`)
//! 2. TOML file (default `config/mediaq.toml`, override via `MEDIAQ_CONFIG`)
//! 3. Built-in defaults
//!
//! Examples:
//! - `MEDIAQ__PATHS__STORE=/var/lib/mediaq/store`
//! - `MEDIAQ__DEFAULTS__CONCURRENCY_LIMIT=4`
//! - `MEDIAQ__FETCHER__ARCHIVE_FLOOR=5MB`
//!
//! Runtime-tunable settings (the persisted `Settings` record) are seeded
//! from the `[defaults]` section on first run and owned by the store after
//! that.

mod models;
mod sources;

pub use models::{Config, DefaultsConfig, FetcherConfig, PathsConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit path, used by tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.fetcher.rounds == 0 {
        return Err(ConfigError::Invalid(
            "fetcher.rounds must be at least 1".into(),
        ));
    }
    if config.fetcher.connect_timeout_secs == 0 || config.fetcher.read_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "fetcher timeouts must be non-zero".into(),
        ));
    }
    if config.fetcher.extractor_mirrors.is_empty() && config.fetcher.release_api.is_none() {
        return Err(ConfigError::Invalid(
            "no extractor source configured: set fetcher.extractor_mirrors or fetcher.release_api"
                .into(),
        ));
    }
    Ok(())
}
