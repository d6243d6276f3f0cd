//! Connection-handoff daemon.
//!
//! `ferryd` accepts TCP connections and hands each one, as a live file
//! descriptor, to a worker process over a per-worker control channel. It
//! never reads application bytes itself.
//!
//! A fixed number of resident workers start with the daemon and serve
//! connections in sequence. When every live worker is busy and the pool has
//! room, the dispatcher spawns a transient worker that serves exactly one
//! connection; at capacity it drops the connection instead. Exited workers
//! are reaped on `SIGCHLD`, and a termination signal cascades into an
//! orderly shutdown of the whole pool.
//!
//! The launch path loads configuration through [`ferry_config`], installs
//! structured telemetry, acquires the runtime lock and, unless
//! `FERRY_FOREGROUND` is set, detaches into the background before binding
//! the listener.

mod bootstrap;
mod dispatch;
mod health;
mod lifecycle;
mod listener;
mod pool;
mod process;
mod processes;
mod settings;
mod telemetry;

pub use bootstrap::{
    BootstrapError, Bootstrapped, ConfigLoader, StaticConfigLoader, SystemConfigLoader,
    bootstrap_with,
};
pub use dispatch::{DispatchError, DispatchOutcome, DispatchStats, Dispatcher, HandoffTimeouts};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use lifecycle::{SignalError, SignalTrigger, SignalWatcher};
pub use listener::{ListenerError, accept_connection, bind_listener};
pub use pool::{
    LiveWorker, PoolError, SlotChoice, WorkerHandle, WorkerPool, WorkerSlot, WorkerState,
    WorkerStatus,
};
pub use process::{
    DaemonizeError, Daemonizer, LaunchError, LaunchMode, SystemDaemonizer, run_daemon,
};
pub use processes::{SpawnError, SystemProcesses, WorkerProcesses};
pub use settings::{DispatchSettings, SettingsError};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
