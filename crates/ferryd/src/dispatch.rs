//! Accept loop and connection handoff.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use ferry_channel::{Readiness, WorkerMode};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::health::HealthReporter;
use crate::lifecycle::{self, SignalWatcher};
use crate::listener::accept_connection;
use crate::pool::{SlotChoice, WorkerPool, WorkerSlot};
use crate::processes::WorkerProcesses;
use crate::settings::DispatchSettings;

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Errors that stop the dispatch loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Waiting on the listener failed.
    #[error("failed to wait for connections: {source}")]
    Poll {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Bounds applied while handing a connection over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffTimeouts {
    /// Bound on one descriptor transfer.
    pub handoff: Duration,
    /// Readiness wait after a transient spawn whose direct handoff failed.
    pub spawn_grace: Duration,
}

impl From<&DispatchSettings> for HandoffTimeouts {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            handoff: settings.handoff_timeout,
            spawn_grace: settings.spawn_grace,
        }
    }
}

/// Running totals kept by the dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Connections accepted from the listener.
    pub accepted: usize,
    /// Connections delivered to a worker.
    pub delivered: usize,
    /// Connections closed without reaching a worker.
    pub dropped: usize,
    /// Transient workers started on demand.
    pub elastic_spawns: usize,
    /// Descriptor transfers that failed; each worker is tried at most once
    /// per connection.
    pub failed_handoffs: usize,
    /// Workers reaped after exiting.
    pub reaped: usize,
}

/// Where a connection ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the worker in this slot.
    Delivered(usize),
    /// Closed by the daemon.
    Dropped,
}

/// Everything the daemon mutates while running.
///
/// Dropping the state without an orderly shutdown runs the shutdown cascade
/// so that no worker outlives it.
pub(crate) struct DaemonState<P>
where
    P: WorkerProcesses,
{
    pub(crate) listener: Option<TcpListener>,
    pub(crate) pool: WorkerPool<P>,
    pub(crate) timeouts: HandoffTimeouts,
    pub(crate) reporter: Arc<dyn HealthReporter>,
    pub(crate) stats: DispatchStats,
    pub(crate) shut_down: bool,
}

impl<P> Drop for DaemonState<P>
where
    P: WorkerProcesses,
{
    fn drop(&mut self) {
        if !self.shut_down {
            warn!(
                target: DISPATCH_TARGET,
                "daemon state dropped without shutdown; terminating workers"
            );
            lifecycle::shutdown_cascade(self);
        }
    }
}

/// Single-threaded dispatcher owning the listener and the worker pool.
pub struct Dispatcher<P>
where
    P: WorkerProcesses,
{
    state: DaemonState<P>,
}

impl<P> Dispatcher<P>
where
    P: WorkerProcesses,
{
    /// Builds a dispatcher over a bound listener and an initialised pool.
    pub fn new(
        listener: TcpListener,
        pool: WorkerPool<P>,
        timeouts: HandoffTimeouts,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            state: DaemonState {
                listener: Some(listener),
                pool,
                timeouts,
                reporter,
                stats: DispatchStats::default(),
                shut_down: false,
            },
        }
    }

    /// Worker pool, for inspection.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool<P> {
        &self.state.pool
    }

    /// Totals so far.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.state.stats
    }

    /// Address the listener is bound to, while it is open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Serves until shutdown is requested, then runs the shutdown cascade.
    pub fn run(&mut self, signals: &SignalWatcher) -> Result<DispatchStats, DispatchError> {
        let result = self.serve(signals);
        self.shutdown();
        result.map(|()| self.state.stats)
    }

    /// Serves connections until a shutdown signal arrives.
    ///
    /// Only the wait on the listener and the signal wake socket is
    /// unbounded; every worker interaction is zero- or short-bounded.
    pub fn serve(&mut self, signals: &SignalWatcher) -> Result<(), DispatchError> {
        info!(
            target: DISPATCH_TARGET,
            live_workers = self.state.pool.active_count(),
            max_workers = self.state.pool.capacity(),
            "dispatcher running"
        );
        loop {
            if signals.take_child_exit() {
                self.reap();
            }
            if signals.take_hangup() {
                debug!(target: DISPATCH_TARGET, "ignoring SIGHUP");
            }
            if signals.shutdown_requested() {
                info!(target: DISPATCH_TARGET, "shutdown requested");
                return Ok(());
            }
            let Some(listener) = self.state.listener.as_ref() else {
                return Ok(());
            };
            let activity = wait_for_activity(listener, signals)?;
            if activity.woken {
                signals.drain_wake();
            }
            if activity.connection {
                self.accept_one();
            }
        }
    }

    /// Runs the shutdown cascade; returns the number of workers signalled.
    pub fn shutdown(&mut self) -> usize {
        lifecycle::shutdown_cascade(&mut self.state)
    }

    /// Reaps exited workers; returns the number of slots released.
    pub fn reap(&mut self) -> usize {
        lifecycle::reap_children(&mut self.state)
    }

    fn accept_one(&mut self) {
        let Some(listener) = self.state.listener.as_ref() else {
            return;
        };
        match accept_connection(listener) {
            Ok(Some((stream, peer))) => {
                self.dispatch(stream, peer);
            }
            Ok(None) => {}
            Err(error) => warn!(
                target: DISPATCH_TARGET,
                error = %error,
                "accept failed"
            ),
        }
    }

    /// Hands `stream` to one worker or drops it.
    ///
    /// Idle workers are tried first, then workers whose readiness byte is
    /// already queued, then a freshly spawned transient worker in the slot
    /// [`WorkerPool::find_idle_slot`] reports vacant. A worker that fails a
    /// handoff is not offered the same connection again. The daemon's copy
    /// of the connection is closed on return in every case.
    pub fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> DispatchOutcome {
        self.state.stats.accepted += 1;
        let outcome = self.route(&stream, peer);
        match outcome {
            DispatchOutcome::Delivered(index) => {
                self.state.stats.delivered += 1;
                info!(
                    target: DISPATCH_TARGET,
                    peer = %peer,
                    slot = index,
                    "connection handed off"
                );
            }
            DispatchOutcome::Dropped => {
                self.state.stats.dropped += 1;
                self.state
                    .reporter
                    .connection_dropped(peer, self.state.pool.active_count());
            }
        }
        drop(stream);
        outcome
    }

    fn route(&mut self, stream: &TcpStream, peer: SocketAddr) -> DispatchOutcome {
        let mut tried = Vec::new();
        let mut scanned = false;
        loop {
            match self.state.pool.find_idle_slot(&tried) {
                Some(SlotChoice::Idle(index)) => {
                    if self.try_hand_off(index, stream, peer, &mut tried) {
                        return DispatchOutcome::Delivered(index);
                    }
                }
                _ if !scanned => {
                    scanned = true;
                    let ready = self.offer_to_ready(stream, peer, Duration::ZERO, &mut tried);
                    if let Some(index) = ready {
                        return DispatchOutcome::Delivered(index);
                    }
                }
                Some(SlotChoice::Vacant(index)) => {
                    return self.offer_to_new_transient(index, stream, peer, &mut tried);
                }
                None => {
                    warn!(
                        target: DISPATCH_TARGET,
                        peer = %peer,
                        max_workers = self.state.pool.capacity(),
                        "all workers busy and pool at capacity; dropping connection"
                    );
                    return DispatchOutcome::Dropped;
                }
            }
        }
    }

    /// Spawns a transient worker into the vacant slot `index` and hands it
    /// the connection, falling back to a readiness wait bounded by the
    /// spawn grace period.
    fn offer_to_new_transient(
        &mut self,
        index: usize,
        stream: &TcpStream,
        peer: SocketAddr,
        tried: &mut Vec<usize>,
    ) -> DispatchOutcome {
        if let Err(error) = self.state.pool.spawn_into(index, WorkerMode::Transient) {
            warn!(
                target: DISPATCH_TARGET,
                peer = %peer,
                slot = index,
                error = %error,
                "elastic worker failed to start"
            );
            return DispatchOutcome::Dropped;
        }
        self.state.stats.elastic_spawns += 1;
        if let Some(worker) = self.state.pool.slot(index).and_then(WorkerSlot::worker) {
            self.state
                .reporter
                .worker_spawned(index, worker.pid(), worker.mode());
        }
        if self.try_hand_off(index, stream, peer, tried) {
            return DispatchOutcome::Delivered(index);
        }
        let grace = self.state.timeouts.spawn_grace;
        self.offer_to_ready(stream, peer, grace, tried)
            .map_or(DispatchOutcome::Dropped, DispatchOutcome::Delivered)
    }

    /// Offers the connection to channels that become readable within
    /// `wait`, consuming one readiness byte per channel in slot order.
    fn offer_to_ready(
        &mut self,
        stream: &TcpStream,
        peer: SocketAddr,
        wait: Duration,
        tried: &mut Vec<usize>,
    ) -> Option<usize> {
        let ready = match self.state.pool.ready_slots(wait) {
            Ok(ready) => ready,
            Err(error) => {
                warn!(
                    target: DISPATCH_TARGET,
                    error = %error,
                    "worker readiness wait failed"
                );
                return None;
            }
        };
        for index in ready {
            if tried.contains(&index) {
                continue;
            }
            match self.state.pool.consume_readiness(index) {
                Ok(Readiness::Ready) => {
                    if self.try_hand_off(index, stream, peer, tried) {
                        return Some(index);
                    }
                }
                Ok(Readiness::Pending) => {}
                Ok(Readiness::Closed) => debug!(
                    target: DISPATCH_TARGET,
                    slot = index,
                    "worker channel closed; awaiting reap"
                ),
                Err(error) => warn!(
                    target: DISPATCH_TARGET,
                    slot = index,
                    error = %error,
                    "failed to read worker readiness"
                ),
            }
        }
        None
    }

    fn try_hand_off(
        &mut self,
        index: usize,
        stream: &TcpStream,
        peer: SocketAddr,
        tried: &mut Vec<usize>,
    ) -> bool {
        tried.push(index);
        let timeout = self.state.timeouts.handoff;
        match self.state.pool.hand_off(index, stream.as_fd(), timeout) {
            Ok(()) => true,
            Err(error) => {
                self.state.stats.failed_handoffs += 1;
                warn!(
                    target: DISPATCH_TARGET,
                    peer = %peer,
                    slot = index,
                    error = %error,
                    "handoff failed; trying another worker"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    connection: bool,
    woken: bool,
}

fn wait_for_activity(
    listener: &TcpListener,
    signals: &SignalWatcher,
) -> Result<Activity, DispatchError> {
    let mut fds = [
        PollFd::new(listener.as_fd(), PollFlags::POLLIN),
        PollFd::new(signals.wake_fd(), PollFlags::POLLIN),
    ];
    match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {
            let [listener_fd, wake_fd] = &fds;
            Ok(Activity {
                connection: listener_fd.any().unwrap_or(false),
                woken: wake_fd.any().unwrap_or(false),
            })
        }
        Err(Errno::EINTR) => Ok(Activity::default()),
        Err(errno) => Err(DispatchError::Poll {
            source: io::Error::from(errno),
        }),
    }
}
