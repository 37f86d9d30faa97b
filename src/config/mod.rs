//! Configuration management module for the coordination client.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`COORD_CONFIG_PATH`)
//! - Environment variable overrides (`COORD__SECTION__KEY`)
//! - Component-wise validation

mod connection;
mod retry;

pub use connection::*;
pub use retry::*;

#[cfg(test)]
mod config_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::PayloadFormat;
use crate::Result;

pub const CONFIG_PATH_ENV: &str = "COORD_CONFIG_PATH";
pub const ENV_PREFIX: &str = "COORD";

/// Main configuration container for the coordination client
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `COORD_CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CoordinatorConfig {
    /// Ensemble addresses, session and chroot settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Initial connection retry policy
    #[serde(default)]
    pub retry: ConnectRetryPolicy,

    /// Serializer used for node payloads
    #[serde(default)]
    pub codec: PayloadFormat,
}

impl CoordinatorConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("COORD__CONNECTION__CHROOT", "/services/billing");
    /// let cfg = CoordinatorConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Ok(config_path) = env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }
        builder = builder.add_source(Self::environment());
        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.connection.validate()?;
        self.retry.validate()?;
        Ok(self)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .ignore_empty(true)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("connection.hosts")
    }
}
