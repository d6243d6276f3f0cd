//! Command line accepted by worker programs.

use std::os::fd::RawFd;

use camino::Utf8PathBuf;
use clap::Parser;
use ferry_channel::WorkerMode;

/// Arguments supplied by the daemon when it starts a worker.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Serve connections handed over by ferryd")]
pub struct WorkerArgs {
    /// Inherited control channel descriptor.
    #[arg(long)]
    pub channel_fd: RawFd,
    /// Whether to serve many connections or exactly one.
    #[arg(long)]
    pub mode: WorkerMode,
    /// Protocol handler configuration.
    #[arg(long)]
    pub config: Option<Utf8PathBuf>,
}
