//! Starting, signalling and reaping worker processes.

use std::collections::BTreeSet;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use ferry_channel::{WorkerEnd, WorkerInvocation, WorkerMode};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

pub(crate) const PROCESSES_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::processes");

/// Errors raised while starting a worker process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The worker program could not be executed.
    #[error("failed to start worker '{program}': {source}")]
    Launch {
        /// Program that failed to start.
        program: Utf8PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The kernel reported a process id outside the `pid_t` range.
    #[error("worker process id {pid} is out of range")]
    ProcessId {
        /// Id reported by the standard library.
        pid: u32,
    },
}

/// Process-management backend used by the worker pool.
///
/// Implementations own every process they start until it has been reaped.
pub trait WorkerProcesses {
    /// Starts a worker in `mode` that inherits `channel`.
    ///
    /// The daemon's copy of the worker end is closed when this returns.
    fn spawn(&mut self, mode: WorkerMode, channel: WorkerEnd) -> Result<Pid, SpawnError>;

    /// Sends the termination signal to `pid`.
    fn terminate(&mut self, pid: Pid) -> Result<(), Errno>;

    /// Collects every worker that has exited, without blocking.
    fn reap_exited(&mut self) -> Vec<Pid>;

    /// Blocks until every remaining worker has exited; returns how many
    /// were collected.
    fn wait_all(&mut self) -> usize;
}

/// Starts the configured worker program as child processes.
#[derive(Debug)]
pub struct SystemProcesses {
    program: Utf8PathBuf,
    config: Option<Utf8PathBuf>,
    children: BTreeSet<Pid>,
}

impl SystemProcesses {
    /// Builds a backend that runs `program`, forwarding `config` to it.
    #[must_use]
    pub fn new(program: Utf8PathBuf, config: Option<Utf8PathBuf>) -> Self {
        Self {
            program,
            config,
            children: BTreeSet::new(),
        }
    }

    /// Number of children started and not yet reaped.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.children.len()
    }
}

impl WorkerProcesses for SystemProcesses {
    fn spawn(&mut self, mode: WorkerMode, channel: WorkerEnd) -> Result<Pid, SpawnError> {
        let channel_fd = channel.as_raw_fd();
        let invocation = WorkerInvocation {
            channel_fd,
            mode,
            config: self.config.as_deref(),
        };
        let mut command = Command::new(self.program.as_std_path());
        command.args(invocation.to_args()).stdin(Stdio::null());
        // SAFETY: the hook runs between fork and exec and only issues
        // async-signal-safe system calls.
        unsafe {
            command.pre_exec(move || prepare_child(channel_fd));
        }
        let child = command.spawn().map_err(|source| SpawnError::Launch {
            program: self.program.clone(),
            source,
        })?;
        drop(channel);

        let raw = child.id();
        let pid = i32::try_from(raw)
            .map(Pid::from_raw)
            .map_err(|_| SpawnError::ProcessId { pid: raw })?;
        self.children.insert(pid);
        debug!(
            target: PROCESSES_TARGET,
            pid = pid.as_raw(),
            mode = %mode,
            program = %self.program,
            "worker process started"
        );
        Ok(pid)
    }

    fn terminate(&mut self, pid: Pid) -> Result<(), Errno> {
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno),
        }
    }

    fn reap_exited(&mut self) -> Vec<Pid> {
        let mut exited = Vec::new();
        for &pid in &self.children {
            if let Some(status) = wait_for_child(pid, Some(WaitPidFlag::WNOHANG)) {
                log_exit(pid, status);
                exited.push(pid);
            }
        }
        for pid in &exited {
            self.children.remove(pid);
        }
        exited
    }

    fn wait_all(&mut self) -> usize {
        let children = std::mem::take(&mut self.children);
        for &pid in &children {
            if let Some(status) = wait_for_child(pid, None) {
                log_exit(pid, status);
            }
        }
        children.len()
    }
}

/// Runs in the forked child: keeps the channel open across `exec` and, on
/// Linux, ties the worker's lifetime to the daemon.
fn prepare_child(channel_fd: RawFd) -> io::Result<()> {
    fcntl(channel_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
    Ok(())
}

/// Waits on one child, retrying interruptions.
///
/// Returns `None` while a non-blocking wait finds the child still running.
/// A child that can no longer be waited on counts as exited.
fn wait_for_child(pid: Pid, flags: Option<WaitPidFlag>) -> Option<ExitStatus> {
    loop {
        match waitpid(pid, flags) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(WaitStatus::Exited(_, code)) => return Some(ExitStatus::Code(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(ExitStatus::Signal(signal)),
            Ok(_) => {
                if flags.is_some() {
                    return None;
                }
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => return Some(ExitStatus::Unknown),
            Err(errno) => {
                warn!(
                    target: PROCESSES_TARGET,
                    pid = pid.as_raw(),
                    error = %errno,
                    "waitpid failed"
                );
                return Some(ExitStatus::Unknown);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ExitStatus {
    Code(i32),
    Signal(Signal),
    Unknown,
}

fn log_exit(pid: Pid, status: ExitStatus) {
    match status {
        ExitStatus::Code(code) => info!(
            target: PROCESSES_TARGET,
            pid = pid.as_raw(),
            code,
            "worker exited"
        ),
        ExitStatus::Signal(signal) => info!(
            target: PROCESSES_TARGET,
            pid = pid.as_raw(),
            signal = %signal,
            "worker killed by signal"
        ),
        ExitStatus::Unknown => debug!(
            target: PROCESSES_TARGET,
            pid = pid.as_raw(),
            "worker already collected"
        ),
    }
}
