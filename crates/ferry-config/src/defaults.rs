//! Built-in values applied when a configuration layer leaves a key unset.

/// Interface the listener binds when no host is configured.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Pending-connection queue length passed to `listen(2)`.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Resident workers started at boot.
pub const DEFAULT_RESIDENT_WORKERS: usize = 1;

/// Upper bound on a single descriptor transfer, in milliseconds.
pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 10_000;

/// Extra readiness wait after a fresh transient spawn, in milliseconds.
pub const DEFAULT_SPAWN_GRACE_MS: u64 = 50;

/// Log filter applied when neither configuration nor environment sets one.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Borrowed form of [`DEFAULT_LOG_FILTER`].
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned form of [`DEFAULT_LOG_FILTER`] for serde defaults.
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// JSON lines unless configured otherwise.
#[must_use]
pub fn default_log_format() -> crate::LogFormat {
    crate::LogFormat::Json
}

pub(crate) fn default_listen_host() -> String {
    DEFAULT_LISTEN_HOST.to_owned()
}

pub(crate) const fn default_listen_backlog() -> i32 {
    DEFAULT_LISTEN_BACKLOG
}

pub(crate) const fn default_resident_workers() -> usize {
    DEFAULT_RESIDENT_WORKERS
}

pub(crate) const fn default_handoff_timeout_ms() -> u64 {
    DEFAULT_HANDOFF_TIMEOUT_MS
}

pub(crate) const fn default_spawn_grace_ms() -> u64 {
    DEFAULT_SPAWN_GRACE_MS
}
