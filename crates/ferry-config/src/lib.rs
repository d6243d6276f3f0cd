//! Shared configuration for the ferry daemon and its workers.
//!
//! Values are layered by [`ortho_config`]: built-in defaults, then a
//! configuration file (`--config-path` or `FERRY_CONFIG_PATH`), then
//! `FERRY_*` environment variables, then command-line flags. The daemon
//! reads every dispatch parameter from [`Config`]; required keys are left as
//! `Option` here and validated by the daemon so that a missing key maps to a
//! distinct exit status.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

mod defaults;
mod runtime;

pub use defaults::{
    DEFAULT_HANDOFF_TIMEOUT_MS, DEFAULT_LISTEN_BACKLOG, DEFAULT_LISTEN_HOST, DEFAULT_LOG_FILTER,
    DEFAULT_RESIDENT_WORKERS, DEFAULT_SPAWN_GRACE_MS, default_log_filter,
    default_log_filter_string, default_log_format,
};
pub use runtime::{RuntimePaths, RuntimePathsError};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, flattened for log shippers.
    #[default]
    Json,
    /// Single-line human-readable output.
    Compact,
}

/// Daemon configuration resolved from every layer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, OrthoConfig)]
#[ortho_config(prefix = "FERRY")]
pub struct Config {
    /// Host or address the listening socket binds to.
    #[serde(default = "defaults::default_listen_host")]
    pub listen_host: String,
    /// TCP port the listening socket binds to.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Pending-connection queue length for `listen(2)`.
    #[serde(default = "defaults::default_listen_backlog")]
    pub listen_backlog: i32,
    /// Executable started for every worker.
    #[serde(default)]
    pub worker_program: Option<Utf8PathBuf>,
    /// Configuration path forwarded to each worker.
    #[serde(default)]
    pub worker_config: Option<Utf8PathBuf>,
    /// Workers spawned at startup that serve connections in sequence.
    #[serde(default = "defaults::default_resident_workers")]
    pub resident_workers: usize,
    /// Upper bound on simultaneously live workers.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Timeout for a single descriptor transfer, in milliseconds.
    #[serde(default = "defaults::default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,
    /// Readiness wait after a transient spawn, in milliseconds.
    #[serde(default = "defaults::default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,
    /// Directory for the lock, pid and health files.
    #[serde(default)]
    pub runtime_dir: Option<Utf8PathBuf>,
    /// `tracing` filter expression.
    #[serde(default = "defaults::default_log_filter_string")]
    pub log_filter: String,
    /// Log output format.
    #[serde(default = "defaults::default_log_format")]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: defaults::default_listen_host(),
            listen_port: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            worker_program: None,
            worker_config: None,
            resident_workers: DEFAULT_RESIDENT_WORKERS,
            max_workers: None,
            handoff_timeout_ms: DEFAULT_HANDOFF_TIMEOUT_MS,
            spawn_grace_ms: DEFAULT_SPAWN_GRACE_MS,
            runtime_dir: None,
            log_filter: default_log_filter_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Returns the configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Returns the configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Descriptor transfer timeout as a [`Duration`].
    #[must_use]
    pub const fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    /// Post-spawn readiness grace period as a [`Duration`].
    #[must_use]
    pub const fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }
}
