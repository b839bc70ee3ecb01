//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `FL_LINK_` prefix and `__` as section separator. An example configuration file can be found in
//! the `configs/` directory located in the repository root.

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    pub log: LoggingSettings,
    #[validate]
    pub paths: PathSettings,
    #[validate]
    pub tls: TlsSettings,
    #[validate]
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Environment::with_prefix("FL_LINK").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_LINK_API__BIND_ADDRESS=127.0.0.1:8000
    /// ```
    pub bind_address: SocketAddr,
}

fn validate_path(path: &PathBuf) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        Err(ValidationError::new("empty path"))
    } else {
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// File system locations.
pub struct PathSettings {
    /// Root of the per-experiment bundle directories `<uploads_dir>/<experiment_id>/`.
    #[validate(custom = "validate_path")]
    pub uploads_dir: PathBuf,
    /// Where the aggregation service writes its `superlink_<timestamp>.log` files.
    #[validate(custom = "validate_path")]
    pub logs_dir: PathBuf,
    /// Parent of the shared Python environment, which lives in `<runtime_dir>/flower`.
    #[validate(custom = "validate_path")]
    pub runtime_dir: PathBuf,
    /// The authorized-keys file handed to the aggregation service.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [paths]
    /// authorized_keys = "/var/lib/fl-link/keys/authorized_keys.csv"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_LINK_PATHS__AUTHORIZED_KEYS=/tmp/authorized_keys.csv
    /// ```
    #[validate(custom = "validate_path")]
    pub authorized_keys: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Validate)]
/// Certificates of the aggregation service.
pub struct TlsSettings {
    #[validate(custom = "validate_path")]
    pub ca_certificate: PathBuf,
    #[validate(custom = "validate_path")]
    pub certificate: PathBuf,
    #[validate(custom = "validate_path")]
    pub private_key: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[serde(default)]
/// The external training backend.
pub struct RuntimeSettings {
    /// Interpreter used to create the shared environment.
    #[validate(length(min = 1))]
    pub python: String,
    /// Requirement installed into a freshly created environment.
    #[validate(length(min = 1))]
    pub flower_requirement: String,
    /// Executable of the aggregation service inside the environment.
    #[validate(length(min = 1))]
    pub aggregator_binary: String,
    /// Executable of the training driver inside the environment.
    #[validate(length(min = 1))]
    pub driver_binary: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            flower_requirement: "flwr==1.15.0".into(),
            aggregator_binary: "flower-superlink".into(),
            driver_binary: "flwr".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_LINK_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
