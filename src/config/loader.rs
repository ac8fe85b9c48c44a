use config::{Config, Environment, File, FileFormat};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use super::profiles::RetrainProfile;
use super::runtime::RuntimeConfig;

const ENV_PREFIX: &str = "RETRAINER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to serialize default configuration: {0}")]
    Defaults(#[from] toml::ser::Error),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Loads configuration with layered overrides.
///
/// Precedence (lowest to highest):
/// 1. Built-in defaults, with the tier table of the selected profile
/// 2. The TOML file at `path`, if it exists
/// 3. `RETRAINER__*` environment variables, after `.env` is loaded
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    if let Ok(env_file) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", env_file.display());
    }

    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }
    let overrides = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = layer_over_profile(overrides)?;
    info!("Configuration loaded: profile={}", config.profile.name());
    Ok(config)
}

/// Parses a TOML document layered over the defaults, without touching the environment
pub fn parse_config(toml_source: &str) -> Result<RuntimeConfig, ConfigError> {
    let overrides = Config::builder()
        .add_source(File::from_str(toml_source, FileFormat::Toml))
        .build()?;
    layer_over_profile(overrides)
}

/// The profile named by the overrides picks the default tier table; the
/// overrides are then applied on top of it
fn layer_over_profile(overrides: Config) -> Result<RuntimeConfig, ConfigError> {
    let profile = match overrides.get::<RetrainProfile>("profile") {
        Ok(profile) => profile,
        Err(config::ConfigError::NotFound(_)) => RetrainProfile::Reference,
        Err(e) => return Err(e.into()),
    };

    let defaults = toml::to_string(&RuntimeConfig {
        profile,
        tiers: profile.tiers(),
        ..RuntimeConfig::default()
    })?;
    let config: RuntimeConfig = Config::builder()
        .add_source(File::from_str(&defaults, FileFormat::Toml))
        .add_source(overrides)
        .build()?
        .try_deserialize()?;

    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}
