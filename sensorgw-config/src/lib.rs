//! # Sensor Gateway Configuration
//!
//! Layered configuration for the gateway process.
//!
//! ## Hierarchy
//! 1. Built-in defaults (the reference deployment)
//! 2. `config/sensorgw.yaml`, or the file given with `--config`
//! 3. `SENSORGW_*` environment variables, nested with `__`
//!    (`SENSORGW_BROKER__HOST=10.0.0.2`)
//!
//! Every section is validated after merging; invalid values never reach
//! the runtime.

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod broker;
mod connection;
mod error;
mod listener;
mod pool;
mod reactor;
mod telemetry;
mod validation;

pub use broker::BrokerConfig;
pub use connection::{ConnectionConfig, ProtocolMode};
pub use error::ConfigError;
pub use listener::ListenerConfig;
pub use pool::PoolConfig;
pub use reactor::ReactorConfig;
pub use telemetry::TelemetryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/sensorgw.yaml";
pub const ENV_PREFIX: &str = "SENSORGW_";

/// Identity stamped onto every published reading.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayIdentity {
    pub id: u32,
}

impl Default for GatewayIdentity {
    fn default() -> Self {
        Self { id: 1 }
    }
}

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    #[validate(nested)]
    pub listener: ListenerConfig,

    #[validate(nested)]
    pub broker: BrokerConfig,

    #[validate(nested)]
    pub reactor: ReactorConfig,

    #[validate(nested)]
    pub pool: PoolConfig,

    #[validate(nested)]
    pub connection: ConnectionConfig,

    #[validate(nested)]
    pub gateway: GatewayIdentity,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Where the file layer of a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
}

impl GatewayConfig {
    /// Loads defaults, the default file if present, and the environment.
    pub fn load() -> Result<(Self, ConfigSource), ConfigError> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        let source = if default_path.exists() {
            ConfigSource::File(default_path.to_path_buf())
        } else {
            ConfigSource::Defaults
        };
        let config = Self::from_figment(Self::figment(&source).merge(Self::env()))?;
        Ok((config, source))
    }

    /// Loads defaults, the given file (which must exist), and the environment.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let source = ConfigSource::File(path.to_path_buf());
        Self::from_figment(Self::figment(&source).merge(Self::env()))
    }

    /// `load_from_path` when a path is given, `load` otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        match path {
            Some(path) => {
                Self::load_from_path(path).map(|c| (c, ConfigSource::File(path.to_path_buf())))
            }
            None => Self::load(),
        }
    }

    /// Defaults merged with the file layer, without the environment.
    pub fn figment(source: &ConfigSource) -> Figment {
        let figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        match source {
            ConfigSource::Defaults => figment,
            ConfigSource::File(path) => figment.merge(Yaml::file(path)),
        }
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    /// Extracts and validates.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}
