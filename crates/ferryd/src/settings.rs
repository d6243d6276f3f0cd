//! Validates configuration into the parameters the dispatcher runs with.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::warn;

use ferry_config::{Config, DEFAULT_LISTEN_BACKLOG};

pub(crate) const SETTINGS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::settings");

/// Errors raised when a required configuration key is absent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// No listening port was configured.
    #[error("listen_port is not configured")]
    MissingListenPort,
    /// No worker program was configured.
    #[error("worker_program is not configured")]
    MissingWorkerProgram,
}

/// Dispatch parameters after defaults and clamping have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Host or address to bind.
    pub listen_host: String,
    /// Port to bind.
    pub listen_port: u16,
    /// Backlog passed to `listen(2)`.
    pub listen_backlog: i32,
    /// Program started for every worker.
    pub worker_program: Utf8PathBuf,
    /// Configuration path forwarded to workers.
    pub worker_config: Option<Utf8PathBuf>,
    /// Resident workers spawned at startup; at least one.
    pub resident_workers: usize,
    /// Upper bound on live workers; never below `resident_workers`.
    pub max_workers: usize,
    /// Bound on a single descriptor transfer.
    pub handoff_timeout: Duration,
    /// Readiness wait after a transient spawn whose direct handoff failed.
    pub spawn_grace: Duration,
}

impl DispatchSettings {
    /// Validates `config`, applying the documented clamps.
    ///
    /// Each clamp is logged at `warn` so operators can correct the source.
    pub fn from_config(config: &Config) -> Result<Self, SettingsError> {
        let listen_port = config.listen_port.ok_or(SettingsError::MissingListenPort)?;
        let worker_program = config
            .worker_program
            .clone()
            .ok_or(SettingsError::MissingWorkerProgram)?;

        let resident_workers = if config.resident_workers == 0 {
            warn!(
                target: SETTINGS_TARGET,
                "resident_workers is zero; starting one resident worker"
            );
            1
        } else {
            config.resident_workers
        };

        let max_workers = match config.max_workers {
            Some(max) if max < resident_workers => {
                warn!(
                    target: SETTINGS_TARGET,
                    max_workers = max,
                    resident_workers,
                    "max_workers below resident_workers; raising it"
                );
                resident_workers
            }
            Some(max) => max,
            None => resident_workers,
        };

        let listen_backlog = if config.listen_backlog > 0 {
            config.listen_backlog
        } else {
            warn!(
                target: SETTINGS_TARGET,
                listen_backlog = config.listen_backlog,
                default = DEFAULT_LISTEN_BACKLOG,
                "listen_backlog must be positive; using default"
            );
            DEFAULT_LISTEN_BACKLOG
        };

        if config.worker_config.is_none() {
            warn!(
                target: SETTINGS_TARGET,
                "worker_config is not set; workers start without a handler configuration"
            );
        }

        Ok(Self {
            listen_host: config.listen_host.clone(),
            listen_port,
            listen_backlog,
            worker_program,
            worker_config: config.worker_config.clone(),
            resident_workers,
            max_workers,
            handoff_timeout: config.handoff_timeout(),
            spawn_grace: config.spawn_grace(),
        })
    }
}
