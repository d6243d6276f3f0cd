//! Startup sequence run before any socket or worker exists.
//!
//! Bootstrapping loads the layered configuration, installs telemetry and
//! validates the keys the dispatcher cannot run without. Each outcome is
//! reported to the [`HealthReporter`].

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

use ferry_config::Config;

use crate::health::HealthReporter;
use crate::settings::{DispatchSettings, SettingsError};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Source of the daemon configuration.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Reads defaults, files, `FERRY_*` variables and the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Hands out a configuration fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Reasons the daemon stops before binding its listener.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// A required key was missing.
    #[error("invalid configuration: {source}")]
    Settings {
        /// Underlying validation error.
        #[source]
        source: SettingsError,
    },
}

/// Configuration, validated settings and telemetry, ready for launch.
#[derive(Debug)]
pub struct Bootstrapped {
    config: Config,
    settings: DispatchSettings,
    telemetry: TelemetryHandle,
}

impl Bootstrapped {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }
}

/// Loads configuration, installs telemetry and validates settings.
///
/// Configuration is loaded before telemetry exists, so a loader failure is
/// only visible through the reporter and the returned error.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: &dyn HealthReporter,
) -> Result<Bootstrapped, BootstrapError> {
    reporter.bootstrap_starting();
    let outcome = load_and_validate(loader);
    match &outcome {
        Ok(ready) => reporter.bootstrap_succeeded(&ready.settings),
        Err(error) => reporter.bootstrap_failed(error),
    }
    outcome
}

fn load_and_validate(loader: &dyn ConfigLoader) -> Result<Bootstrapped, BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    let settings = DispatchSettings::from_config(&config)
        .map_err(|source| BootstrapError::Settings { source })?;
    Ok(Bootstrapped {
        config,
        settings,
        telemetry,
    })
}
