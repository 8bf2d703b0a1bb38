//! Loading and validation of the coordinator settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `XAIN_`, using `__` as a separator between sections and keys, for instance
//! `XAIN_FEDERATED_LEARNING__ROUNDS=10`.

use config::{Config, ConfigError, Environment};
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::common::{
    model::{self, Model, ModelError},
    settings::LoggingSettings,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings. Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub federated_learning: FederatedLearningSettings,
    #[validate]
    pub model: ModelSettings,
    #[serde(default)]
    pub log: LoggingSettings,
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
            .add_source(Environment::with_prefix("xain").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// HTTP API settings.
pub struct ApiSettings {
    /// The address to which the HTTP API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAIN_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: SocketAddr,
}

#[derive(Debug, Validate, Deserialize, Clone, PartialEq)]
#[validate(schema(function = "validate_fl"))]
/// Settings of the training rounds.
pub struct FederatedLearningSettings {
    /// The number of rounds after which the coordinator finishes.
    #[validate(range(min = 1))]
    pub rounds: u32,

    /// The number of participants that must be registered before the first round starts, and the
    /// number of live participants required to start any subsequent round.
    #[validate(range(min = 1))]
    pub min_clients: u32,

    /// The maximal number of registered participants. Rendezvous requests beyond that are
    /// answered with `LATER`.
    #[validate(range(min = 1))]
    pub max_clients: u32,

    /// The fraction of live participants selected for each round. The value must be in `(0, 1]`.
    /// At least one participant is always selected.
    pub participants_ratio: f64,

    /// The number of local epochs each selected participant runs per round.
    #[validate(range(min = 1))]
    pub epochs: u32,

    /// The time after which a participant that did not send any heartbeat is considered dead,
    /// in seconds.
    #[validate(range(min = 1))]
    pub heartbeat_timeout: u64,

    /// The time after which a round closes with whatever updates were submitted, in seconds.
    #[validate(range(min = 1))]
    pub round_timeout: u64,

    /// The interval between two liveness sweeps and round deadline checks, in milliseconds.
    #[serde(default = "default_liveness_check_interval")]
    #[validate(range(min = 1))]
    pub liveness_check_interval: u64,
}

fn default_liveness_check_interval() -> u64 {
    500
}

impl FederatedLearningSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval)
    }

    fn validate_fl(&self) -> Result<(), ValidationError> {
        if self.min_clients > self.max_clients {
            return Err(ValidationError::new("min_clients exceeds max_clients"));
        }
        if !(0. < self.participants_ratio && self.participants_ratio <= 1.) {
            return Err(ValidationError::new("participants_ratio must be in (0, 1]"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_fl(s: &FederatedLearningSettings) -> Result<(), ValidationError> {
    s.validate_fl()
}

#[derive(Debug, Validate, Deserialize, Clone, PartialEq)]
/// Settings of the initial global model.
pub struct ModelSettings {
    /// The shape of each tensor of the model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// shapes = [[784, 10], [10]]
    /// ```
    #[validate(length(min = 1))]
    pub shapes: Vec<Vec<usize>>,

    /// A JSON file holding the initial weights. The weights are initialized to zero if this is
    /// not set.
    #[serde(default)]
    pub initial_weights: Option<PathBuf>,
}

impl ModelSettings {
    /// Build the initial global model.
    ///
    /// # Errors
    /// Fails if the initial weights cannot be read or do not have the configured shape.
    pub fn initial_model(&self) -> Result<Model, ModelError> {
        match self.initial_weights {
            Some(ref path) => model::load_json(path, &self.shapes),
            None => Ok(model::zeros(&self.shapes)),
        }
    }
}
