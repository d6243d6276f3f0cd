//! Fixed-capacity pool of worker slots.
//!
//! The pool owns `max` slots for its whole lifetime. Slots are filled by
//! resident spawns at initialisation and by elastic spawns later, and are
//! emptied when their worker is reaped or at shutdown. The readiness watch
//! set is rebuilt from the slots on every wait, so a watch entry exists for
//! a slot exactly when that slot holds a live worker.

mod slot;

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use ferry_channel::{ChannelError, ControlChannel, HandoffError, Readiness, WorkerMode};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::health::HealthReporter;
use crate::processes::{SpawnError, WorkerProcesses};

pub use slot::{LiveWorker, WorkerHandle, WorkerSlot, WorkerState, WorkerStatus};

pub(crate) const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pool");

/// Errors raised while filling pool slots.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The control channel for a new worker could not be created.
    #[error("failed to create worker channel: {0}")]
    Channel(#[from] ChannelError),
    /// The worker process could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Every slot already holds a live worker.
    #[error("worker pool is at capacity ({max} workers)")]
    AtCapacity {
        /// Pool capacity.
        max: usize,
    },
    /// The requested slot does not exist or already holds a live worker.
    #[error("slot {index} is not vacant")]
    SlotTaken {
        /// Requested slot.
        index: usize,
    },
    /// Not a single resident worker could be started.
    #[error("no worker could be started ({requested} requested)")]
    NoWorkers {
        /// Resident workers requested.
        requested: usize,
    },
}

/// Slot chosen for the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChoice {
    /// A worker that has announced readiness and holds no connection.
    Idle(usize),
    /// An empty slot a new worker can be spawned into.
    Vacant(usize),
}

/// Ordered collection of worker slots plus the process backend that fills
/// them.
#[derive(Debug)]
pub struct WorkerPool<P> {
    slots: Vec<WorkerSlot>,
    processes: P,
}

impl<P> WorkerPool<P>
where
    P: WorkerProcesses,
{
    /// Builds a pool of `max` empty slots.
    pub fn new(processes: P, max: usize) -> Self {
        let mut slots = Vec::with_capacity(max);
        slots.resize_with(max, WorkerSlot::default);
        Self { slots, processes }
    }

    /// Builds a pool of `max` slots and spawns `resident` workers into the
    /// first of them.
    ///
    /// Individual spawn failures are logged and leave their slot empty; the
    /// call fails only if no worker starts at all.
    pub fn initialise(
        processes: P,
        resident: usize,
        max: usize,
        reporter: &dyn HealthReporter,
    ) -> Result<Self, PoolError> {
        let mut pool = Self::new(processes, max.max(resident));
        for _ in 0..resident {
            match pool.spawn(WorkerMode::Resident) {
                Ok(index) => {
                    if let Some(worker) = pool.slot(index).and_then(WorkerSlot::worker) {
                        reporter.worker_spawned(index, worker.pid(), worker.mode());
                    }
                }
                Err(error) => {
                    warn!(
                        target: POOL_TARGET,
                        error = %error,
                        "resident worker failed to start"
                    );
                }
            }
        }
        if pool.active_count() == 0 {
            return Err(PoolError::NoWorkers {
                requested: resident,
            });
        }
        Ok(pool)
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots holding a live worker.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_alive()).count()
    }

    /// Slot at `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&WorkerSlot> {
        self.slots.get(index)
    }

    /// Status of every slot, in slot order.
    #[must_use]
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.slots.iter().map(WorkerSlot::status).collect()
    }

    /// Process backend, for inspection.
    #[must_use]
    pub fn processes(&self) -> &P {
        &self.processes
    }

    /// Returns the first idle worker not listed in `skip`, or failing that
    /// the first empty slot.
    ///
    /// `skip` holds the workers already offered the current connection.
    /// `None` means the pool is at capacity with no eligible idle worker.
    #[must_use]
    pub fn find_idle_slot(&self, skip: &[usize]) -> Option<SlotChoice> {
        self.idle_slots()
            .into_iter()
            .find(|index| !skip.contains(index))
            .map(SlotChoice::Idle)
            .or_else(|| self.first_vacant().map(SlotChoice::Vacant))
    }

    fn first_vacant(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.is_alive())
    }

    /// Indices of every idle worker, in slot order.
    #[must_use]
    pub fn idle_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status() == WorkerStatus::Idle)
            .map(|(index, _)| index)
            .collect()
    }

    /// Number of channels the next readiness wait will watch.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watch_set().len()
    }

    /// Waits up to `timeout` for live channels to become readable and
    /// returns their slot indices in order.
    ///
    /// A readable channel either holds a readiness byte or has been closed
    /// by its worker. Interrupted waits resume with the remaining time.
    pub fn ready_slots(&self, timeout: Duration) -> io::Result<Vec<usize>> {
        let watched = self.watch_set();
        if watched.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let mut fds: Vec<PollFd<'_>> = watched
                .iter()
                .map(|(_, fd)| PollFd::new(*fd, PollFlags::POLLIN))
                .collect();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll_timeout = PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX);
            match poll(&mut fds, poll_timeout) {
                Ok(0) => return Ok(Vec::new()),
                Ok(_) => {
                    return Ok(watched
                        .iter()
                        .zip(&fds)
                        .filter(|(_, fd)| fd.revents().is_some_and(|events| !events.is_empty()))
                        .map(|((index, _), _)| *index)
                        .collect());
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
    }

    fn watch_set(&self) -> Vec<(usize, BorrowedFd<'_>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.worker().map(|worker| (index, worker.channel.as_fd())))
            .collect()
    }

    /// Reads one readiness byte from the worker in `index`, marking it idle
    /// when one arrives.
    pub fn consume_readiness(&mut self, index: usize) -> Result<Readiness, ChannelError> {
        let Some(worker) = self.slots.get(index).and_then(WorkerSlot::worker) else {
            return Ok(Readiness::Closed);
        };
        let readiness = worker.channel.read_ready()?;
        if readiness == Readiness::Ready {
            self.mark_idle(index);
        }
        Ok(readiness)
    }

    /// Transfers `descriptor` to the idle worker in `index` and marks it
    /// busy. On failure the worker keeps its state.
    pub fn hand_off(
        &mut self,
        index: usize,
        descriptor: BorrowedFd<'_>,
        timeout: Duration,
    ) -> Result<(), HandoffError> {
        let Some(worker) = self.slots.get(index).and_then(WorkerSlot::worker) else {
            return Err(HandoffError::Closed);
        };
        worker.channel.send_descriptor(descriptor, timeout)?;
        self.mark_busy(index);
        Ok(())
    }

    /// Moves the worker in `index` from idle to busy.
    pub fn mark_busy(&mut self, index: usize) {
        self.transition(index, &[WorkerState::Idle], WorkerState::Busy);
    }

    /// Moves the worker in `index` from starting or busy to idle.
    pub fn mark_idle(&mut self, index: usize) {
        self.transition(
            index,
            &[WorkerState::Starting, WorkerState::Busy],
            WorkerState::Idle,
        );
    }

    fn transition(&mut self, index: usize, from: &[WorkerState], to: WorkerState) {
        let current = self.slots.get_mut(index).and_then(WorkerSlot::worker_mut);
        match current {
            Some(worker) if from.contains(&worker.state) => worker.state = to,
            Some(worker) => {
                error!(
                    target: POOL_TARGET,
                    slot = index,
                    state = %worker.state,
                    target_state = %to,
                    "invalid worker state transition"
                );
                debug_assert!(false, "invalid transition {} -> {to}", worker.state);
            }
            None => {
                error!(
                    target: POOL_TARGET,
                    slot = index,
                    target_state = %to,
                    "state transition on an empty slot"
                );
                debug_assert!(false, "transition on empty slot {index}");
            }
        }
    }

    /// Empties the slot whose worker has `pid`, closing its channel.
    ///
    /// Returns the slot index, or `None` when no live worker has that pid.
    pub fn mark_terminated(&mut self, pid: Pid) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.worker().is_some_and(|worker| worker.pid == pid));
        match index {
            Some(index) => {
                if let Some(slot) = self.slots.get_mut(index) {
                    drop(slot.vacate());
                }
                debug!(
                    target: POOL_TARGET,
                    slot = index,
                    pid = pid.as_raw(),
                    "slot released"
                );
                Some(index)
            }
            None => {
                debug!(
                    target: POOL_TARGET,
                    pid = pid.as_raw(),
                    "exited process does not own a slot"
                );
                None
            }
        }
    }

    /// Starts a worker in `mode` in the first empty slot and returns its
    /// index.
    pub fn spawn(&mut self, mode: WorkerMode) -> Result<usize, PoolError> {
        let index = self.first_vacant().ok_or(PoolError::AtCapacity {
            max: self.capacity(),
        })?;
        self.spawn_into(index, mode)?;
        Ok(index)
    }

    /// Starts a worker in `mode` in the vacant slot `index`.
    ///
    /// The channel is created before the process, so a channel failure
    /// never leaves a worker behind. Residents start in
    /// [`WorkerState::Starting`]; transients are primed and start
    /// [`WorkerState::Idle`] because they expect a descriptor immediately.
    pub fn spawn_into(&mut self, index: usize, mode: WorkerMode) -> Result<(), PoolError> {
        if self.slots.get(index).is_none_or(WorkerSlot::is_alive) {
            return Err(PoolError::SlotTaken { index });
        }
        let (channel, worker_end) = ControlChannel::pair()?;
        let pid = self.processes.spawn(mode, worker_end)?;
        let state = match mode {
            WorkerMode::Resident => WorkerState::Starting,
            WorkerMode::Transient => WorkerState::Idle,
        };
        if let Some(slot) = self.slots.get_mut(index) {
            slot.handle = WorkerHandle::Alive(LiveWorker {
                pid,
                channel,
                mode,
                state,
            });
        }
        debug!(
            target: POOL_TARGET,
            slot = index,
            pid = pid.as_raw(),
            mode = %mode,
            "worker assigned to slot"
        );
        Ok(())
    }

    /// Collects exited workers and empties their slots.
    ///
    /// Returns the `(slot, pid)` of each worker that owned a slot.
    pub fn reap(&mut self) -> Vec<(usize, Pid)> {
        let exited = self.processes.reap_exited();
        exited
            .into_iter()
            .filter_map(|pid| self.mark_terminated(pid).map(|index| (index, pid)))
            .collect()
    }

    /// Signals every live worker, then empties every slot.
    ///
    /// Returns how many workers were signalled. A second call finds no live
    /// workers and signals nobody.
    pub fn terminate_all(&mut self) -> usize {
        let mut signalled = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(worker) = slot.worker() else {
                continue;
            };
            match self.processes.terminate(worker.pid) {
                Ok(()) => signalled += 1,
                Err(errno) => warn!(
                    target: POOL_TARGET,
                    slot = index,
                    pid = worker.pid.as_raw(),
                    error = %errno,
                    "failed to signal worker"
                ),
            }
        }
        for slot in &mut self.slots {
            drop(slot.vacate());
        }
        signalled
    }

    /// Blocks until every worker process has exited.
    pub fn wait_all(&mut self) -> usize {
        self.processes.wait_all()
    }
}
