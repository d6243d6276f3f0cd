//! Logging setup for worker programs.
//!
//! Workers inherit the daemon's environment, so the daemon's
//! `FERRY_LOG_FILTER` and `FERRY_LOG_FORMAT` settings apply to them as well.

use std::env;
use std::io::{self, IsTerminal};

use ferry_config::{LogFormat, default_log_filter};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, fmt};

const FILTER_VAR: &str = "FERRY_LOG_FILTER";
const FORMAT_VAR: &str = "FERRY_LOG_FORMAT";

/// Errors raised while installing the worker subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter expression from the environment is invalid.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// A global subscriber is already installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(String),
}

/// Installs a stderr subscriber configured from the environment.
pub fn initialise() -> Result<(), TelemetryError> {
    let filter = env::var(FILTER_VAR).unwrap_or_else(|_| default_log_filter().to_owned());
    let filter =
        EnvFilter::try_new(filter).map_err(|error| TelemetryError::Filter(error.to_string()))?;
    let format = env::var(FORMAT_VAR)
        .ok()
        .and_then(|value| value.parse::<LogFormat>().ok())
        .unwrap_or_default();

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(UtcTime::rfc_3339());
    let result = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|error| TelemetryError::Subscriber(error.to_string()))
}
