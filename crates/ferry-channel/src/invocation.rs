//! Command line contract between the daemon and worker programs.

use std::ffi::OsString;
use std::os::fd::RawFd;

use camino::Utf8Path;
use strum::{Display, EnumString};

/// Flag naming the inherited control channel descriptor.
pub const CHANNEL_FD_FLAG: &str = "--channel-fd";
/// Flag naming the worker's run mode.
pub const MODE_FLAG: &str = "--mode";
/// Flag naming the protocol handler's configuration file.
pub const CONFIG_FLAG: &str = "--config";

/// How a worker serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WorkerMode {
    /// Long-lived; announces readiness and serves connections in sequence.
    Resident,
    /// Serves exactly one connection handed to it at spawn time, then
    /// exits.
    Transient,
}

/// Arguments passed to a worker program after its path.
#[derive(Debug, Clone, Copy)]
pub struct WorkerInvocation<'a> {
    /// Descriptor number of the inherited channel end.
    pub channel_fd: RawFd,
    /// Run mode for the worker.
    pub mode: WorkerMode,
    /// Optional handler configuration path.
    pub config: Option<&'a Utf8Path>,
}

impl WorkerInvocation<'_> {
    /// Renders the argument vector, excluding the program path.
    #[must_use]
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(CHANNEL_FD_FLAG),
            OsString::from(self.channel_fd.to_string()),
            OsString::from(MODE_FLAG),
            OsString::from(self.mode.to_string()),
        ];
        if let Some(config) = self.config {
            args.push(OsString::from(CONFIG_FLAG));
            args.push(OsString::from(config.as_str()));
        }
        args
    }
}
