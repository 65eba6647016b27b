use crate::config::AppConfig;
use crate::error::{ReconError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/Config.toml";

/// Prefix of environment overrides, e.g. `RECON_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "RECON_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from the default file location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be parsed or is invalid.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration by layering built-in defaults, the TOML file at
    /// `path` (if it exists) and `RECON_` environment variables, then validates it.
    ///
    /// # Errors
    ///
    /// Returns `ReconError::Configuration` if the sources cannot be parsed or
    /// the merged configuration is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let config: AppConfig = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ReconError::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// The provider stack, exposed for callers that add their own layers.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
