//! Runtime directory layout for `ferryd`.
//!
//! The directory holds a lock taken at startup to keep a single daemon per
//! directory, the daemon's pid, a JSON health snapshot and, once detached,
//! the daemon's log. An explicit `runtime_dir` wins; otherwise the per-user
//! runtime directory (`$XDG_RUNTIME_DIR/ferry`) is used, falling back to a
//! uid-scoped directory under the system temp dir.

use std::fs::DirBuilder;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

const RUNTIME_NAMESPACE: &str = "ferry";
const RUNTIME_DIR_MODE: u32 = 0o700;

/// Locations of the files `ferryd` keeps while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
    log_path: PathBuf,
}

impl RuntimePaths {
    /// Resolves the runtime directory for `config` and makes sure it exists.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let runtime_dir = match config.runtime_dir.as_ref() {
            Some(dir) => dir.clone().into_std_path_buf(),
            None => default_runtime_directory(),
        };
        Self::in_directory(runtime_dir)
    }

    /// Lays the runtime files out inside `runtime_dir`, creating it with
    /// owner-only permissions when it is missing.
    pub fn in_directory(runtime_dir: PathBuf) -> Result<Self, RuntimePathsError> {
        ensure_directory(&runtime_dir)?;
        let file = |extension: &str| runtime_dir.join(format!("ferryd.{extension}"));
        Ok(Self {
            lock_path: file("lock"),
            pid_path: file("pid"),
            health_path: file("health"),
            log_path: file("log"),
            runtime_dir,
        })
    }

    /// Directory holding the runtime files.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Lock file; its presence marks a daemon as starting or running.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    #[must_use]
    pub fn health_path(&self) -> &Path {
        &self.health_path
    }

    /// Standard output and error of a detached daemon are appended here.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn ensure_directory(dir: &Path) -> Result<(), RuntimePathsError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(RUNTIME_DIR_MODE);
    }
    builder
        .create(dir)
        .map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(unix)]
fn default_runtime_directory() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join(RUNTIME_NAMESPACE),
        None => std::env::temp_dir()
            .join(RUNTIME_NAMESPACE)
            .join(format!("uid-{}", nix::unistd::Uid::effective())),
    }
}

#[cfg(not(unix))]
fn default_runtime_directory() -> PathBuf {
    std::env::temp_dir().join(RUNTIME_NAMESPACE)
}

/// The runtime directory could not be prepared.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
