//! Background detachment for `ferryd`.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use daemonize_me::Daemon;
use thiserror::Error;
use tracing::info;

use ferry_config::RuntimePaths;

use super::PROCESS_TARGET;

/// Files created after detaching are private to the daemon's user.
const DETACHED_UMASK: u16 = 0o077;

/// Moves the current process into the background.
///
/// Implementations return in the detached process; the original process
/// does not return.
pub trait Daemonizer: Send + Sync {
    /// Detaches, leaving `paths.runtime_dir()` as the working directory.
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError>;
}

/// Detachment failed before the dispatcher started.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    /// The detached log could not be opened.
    #[error("failed to open daemon log '{path}': {source}")]
    Log {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// `daemonize-me` reported a failure.
    #[error("{0}")]
    System(#[from] daemonize_me::DaemonError),
}

/// Detaches with a double fork through `daemonize-me`.
///
/// Standard output and error are appended to [`RuntimePaths::log_path`],
/// so the stderr subscriber keeps writing after the terminal is gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDaemonizer;

impl SystemDaemonizer {
    /// Builds the production daemoniser.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Daemonizer for SystemDaemonizer {
    fn daemonize(&self, paths: &RuntimePaths) -> Result<(), DaemonizeError> {
        let parent = std::process::id();
        let log = paths.log_path();
        info!(
            target: PROCESS_TARGET,
            log = %log.display(),
            "detaching from controlling terminal"
        );
        Daemon::new()
            .umask(DETACHED_UMASK)
            .work_dir(paths.runtime_dir())
            .name(OsStr::new(env!("CARGO_PKG_NAME")))
            .stdout(open_log(log)?)
            .stderr(open_log(log)?)
            .start()?;
        info!(
            target: PROCESS_TARGET,
            parent,
            pid = std::process::id(),
            "running detached"
        );
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File, DaemonizeError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| DaemonizeError::Log {
            path: path.to_path_buf(),
            source,
        })
}
