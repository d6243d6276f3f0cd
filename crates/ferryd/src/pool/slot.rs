//! Per-slot worker bookkeeping.

use ferry_channel::{ControlChannel, WorkerMode};
use nix::unistd::Pid;
use strum::Display;

/// Dispatch state of a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    /// Spawned as a resident, readiness not yet consumed.
    Starting,
    /// Blocked on receiving a descriptor; safe to hand a connection to.
    Idle,
    /// Serving a connection.
    Busy,
}

/// Externally visible status of a slot, including empty ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerStatus {
    /// See [`WorkerState::Starting`].
    Starting,
    /// See [`WorkerState::Idle`].
    Idle,
    /// See [`WorkerState::Busy`].
    Busy,
    /// No live worker occupies the slot.
    Terminated,
}

impl From<WorkerState> for WorkerStatus {
    fn from(state: WorkerState) -> Self {
        match state {
            WorkerState::Starting => Self::Starting,
            WorkerState::Idle => Self::Idle,
            WorkerState::Busy => Self::Busy,
        }
    }
}

/// A running worker and the daemon end of its channel.
#[derive(Debug)]
pub struct LiveWorker {
    pub(crate) pid: Pid,
    pub(crate) channel: ControlChannel,
    pub(crate) mode: WorkerMode,
    pub(crate) state: WorkerState,
}

impl LiveWorker {
    /// Process id of the worker.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Mode the worker was started in.
    #[must_use]
    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    /// Current dispatch state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }
}

/// Occupant of a pool slot.
///
/// An empty slot owns no channel, so a dead worker can never be watched or
/// handed a connection.
#[derive(Debug, Default)]
pub enum WorkerHandle {
    /// A running worker.
    Alive(LiveWorker),
    /// Free for the next spawn.
    #[default]
    Empty,
}

/// One position in the pool. Slots keep their index for the pool's
/// lifetime.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    pub(crate) handle: WorkerHandle,
}

impl WorkerSlot {
    /// Live worker in this slot, if any.
    #[must_use]
    pub fn worker(&self) -> Option<&LiveWorker> {
        match &self.handle {
            WorkerHandle::Alive(worker) => Some(worker),
            WorkerHandle::Empty => None,
        }
    }

    pub(crate) fn worker_mut(&mut self) -> Option<&mut LiveWorker> {
        match &mut self.handle {
            WorkerHandle::Alive(worker) => Some(worker),
            WorkerHandle::Empty => None,
        }
    }

    /// Reported status of the slot.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.worker()
            .map_or(WorkerStatus::Terminated, |worker| worker.state.into())
    }

    /// Whether a live worker occupies the slot.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self.handle, WorkerHandle::Alive(_))
    }

    /// Empties the slot, returning the worker that occupied it. Dropping the
    /// returned worker closes its channel.
    pub(crate) fn vacate(&mut self) -> Option<LiveWorker> {
        match std::mem::take(&mut self.handle) {
            WorkerHandle::Alive(worker) => Some(worker),
            WorkerHandle::Empty => None,
        }
    }
}
