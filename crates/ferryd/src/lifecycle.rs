//! Signal intake, child reaping and the shutdown cascade.
//!
//! Signal handlers never touch the pool. Each handled signal sets an atomic
//! flag and writes a byte to a self-wake socket that the dispatcher watches
//! next to the listener, so the main loop notices the signal promptly and
//! acts on it outside signal context.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::{flag, low_level};
use thiserror::Error;
use tracing::{debug, info};

use crate::dispatch::DaemonState;
use crate::processes::WorkerProcesses;

pub(crate) const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// Errors raised while installing signal handling.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The wake socket could not be created.
    #[error("failed to create signal wake socket: {source}")]
    WakeSocket {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A handler could not be registered.
    #[error("failed to install handler for signal {signal}: {source}")]
    Install {
        /// Signal number.
        signal: i32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    child_exit: Arc<AtomicBool>,
    hangup: Arc<AtomicBool>,
}

/// Receives process signals on behalf of the dispatcher.
#[derive(Debug)]
pub struct SignalWatcher {
    flags: SignalFlags,
    wake_read: UnixStream,
    registrations: Vec<SigId>,
}

/// Posts signal notifications to a detached [`SignalWatcher`] by hand.
#[derive(Debug)]
pub struct SignalTrigger {
    shutdown: Arc<AtomicBool>,
    child_exit: Arc<AtomicBool>,
    wake: UnixStream,
}

impl SignalWatcher {
    /// Registers handlers for the termination signals, `SIGCHLD` and
    /// `SIGHUP`.
    ///
    /// `SIGTERM`, `SIGINT` and `SIGQUIT` request shutdown, `SIGCHLD` requests
    /// reaping, and `SIGHUP` is recorded and ignored. Handlers are removed
    /// when the watcher drops.
    pub fn install() -> Result<Self, SignalError> {
        let (wake_read, wake_write) = wake_pair()?;
        let flags = SignalFlags::default();
        let mut watcher = Self {
            flags,
            wake_read,
            registrations: Vec::new(),
        };
        let routes = [
            (SIGTERM, Arc::clone(&watcher.flags.shutdown)),
            (SIGINT, Arc::clone(&watcher.flags.shutdown)),
            (SIGQUIT, Arc::clone(&watcher.flags.shutdown)),
            (SIGCHLD, Arc::clone(&watcher.flags.child_exit)),
            (SIGHUP, Arc::clone(&watcher.flags.hangup)),
        ];
        for (signal, target) in routes {
            let install = |source| SignalError::Install { signal, source };
            watcher
                .registrations
                .push(flag::register(signal, target).map_err(install)?);
            let pipe = wake_write.try_clone().map_err(install)?;
            watcher
                .registrations
                .push(low_level::pipe::register(signal, pipe).map_err(install)?);
        }
        info!(
            target: LIFECYCLE_TARGET,
            "signal handlers installed"
        );
        Ok(watcher)
    }

    /// Builds a watcher with no OS registration, driven through the returned
    /// trigger. Used to run the dispatcher in-process.
    pub fn detached() -> Result<(Self, SignalTrigger), SignalError> {
        let (wake_read, wake_write) = wake_pair()?;
        let flags = SignalFlags::default();
        let trigger = SignalTrigger {
            shutdown: Arc::clone(&flags.shutdown),
            child_exit: Arc::clone(&flags.child_exit),
            wake: wake_write,
        };
        let watcher = Self {
            flags,
            wake_read,
            registrations: Vec::new(),
        };
        Ok((watcher, trigger))
    }

    /// Whether a termination signal has arrived.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    /// Clears and returns the child-exit flag.
    pub fn take_child_exit(&self) -> bool {
        self.flags.child_exit.swap(false, Ordering::SeqCst)
    }

    /// Clears and returns the hang-up flag.
    pub fn take_hangup(&self) -> bool {
        self.flags.hangup.swap(false, Ordering::SeqCst)
    }

    /// Descriptor that becomes readable whenever a signal is posted.
    #[must_use]
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }

    /// Discards queued wake bytes.
    pub fn drain_wake(&self) {
        let mut buffer = [0_u8; 64];
        loop {
            match (&self.wake_read).read(&mut buffer) {
                Ok(0) => return,
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            low_level::unregister(id);
        }
    }
}

impl SignalTrigger {
    /// Requests shutdown as a termination signal would.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Announces a child exit as `SIGCHLD` would.
    pub fn notify_child_exit(&self) {
        self.child_exit.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        // A full socket already guarantees a pending wake-up.
        if let Err(error) = (&self.wake).write(&[1]) {
            debug!(
                target: LIFECYCLE_TARGET,
                error = %error,
                "wake byte not written"
            );
        }
    }
}

fn wake_pair() -> Result<(UnixStream, UnixStream), SignalError> {
    let wake = |source| SignalError::WakeSocket { source };
    let (read, write) = UnixStream::pair().map_err(wake)?;
    read.set_nonblocking(true).map_err(wake)?;
    write.set_nonblocking(true).map_err(wake)?;
    Ok((read, write))
}

/// Collects every exited worker and empties its slot.
///
/// Returns the number of slots released.
pub(crate) fn reap_children<P>(state: &mut DaemonState<P>) -> usize
where
    P: WorkerProcesses,
{
    let reaped = state.pool.reap();
    for &(index, pid) in &reaped {
        state.reporter.worker_terminated(index, pid);
    }
    state.stats.reaped += reaped.len();
    reaped.len()
}

/// Stops accepting, terminates every live worker and waits for all of them.
///
/// The listener closes first, then each live worker receives `SIGTERM`,
/// then every channel closes, then the call blocks until every worker has
/// exited. Returns the number of workers signalled; running it again
/// signals nobody and returns zero immediately.
pub(crate) fn shutdown_cascade<P>(state: &mut DaemonState<P>) -> usize
where
    P: WorkerProcesses,
{
    if state.shut_down {
        return 0;
    }
    state.shut_down = true;
    drop(state.listener.take());
    info!(
        target: LIFECYCLE_TARGET,
        live_workers = state.pool.active_count(),
        "shutting down worker pool"
    );
    let signalled = state.pool.terminate_all();
    let collected = state.pool.wait_all();
    info!(
        target: LIFECYCLE_TARGET,
        signalled,
        collected,
        "all workers exited"
    );
    state.reporter.shutdown_completed(signalled);
    signalled
}
