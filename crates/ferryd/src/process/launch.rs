//! Supervises daemon launch sequencing and runtime orchestration.

use std::env;
use std::sync::Arc;

use tracing::info;

use ferry_config::RuntimePaths;

use crate::StructuredHealthReporter;
use crate::bootstrap::{ConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::dispatch::{Dispatcher, HandoffTimeouts};
use crate::health::HealthReporter;
use crate::lifecycle::SignalWatcher;
use crate::listener::bind_listener;
use crate::pool::WorkerPool;
use crate::processes::SystemProcesses;

use super::daemonizer::{Daemonizer, SystemDaemonizer};
use super::errors::LaunchError;
use super::guard::{HealthState, ProcessGuard};
use super::{FOREGROUND_ENV_VAR, PROCESS_TARGET};

/// Launch mode for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork into the background and detach from the controlling terminal.
    Background,
    /// Remain attached to the terminal; used for debugging and tests.
    Foreground,
}

impl LaunchMode {
    fn detect() -> Self {
        if env::var_os(FOREGROUND_ENV_VAR).is_some() {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Collaborators required to launch the daemon runtime.
pub(crate) struct LaunchPlan<L, D> {
    pub(crate) mode: LaunchMode,
    pub(crate) daemonizer: D,
    pub(crate) loader: L,
    pub(crate) reporter: Arc<dyn HealthReporter>,
}

/// Runs the daemon using the production collaborators.
///
/// Setting `FERRY_FOREGROUND` keeps the process attached to the terminal.
pub fn run_daemon() -> Result<(), LaunchError> {
    let plan = LaunchPlan {
        mode: LaunchMode::detect(),
        daemonizer: SystemDaemonizer::new(),
        loader: SystemConfigLoader,
        reporter: Arc::new(StructuredHealthReporter::new()),
    };
    run_daemon_with(plan)
}

/// Runs the daemon with injected collaborators.
pub(crate) fn run_daemon_with<L, D>(plan: LaunchPlan<L, D>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    D: Daemonizer,
{
    let LaunchPlan {
        mode,
        daemonizer,
        loader,
        reporter,
    } = plan;

    let bootstrapped = bootstrap_with(&loader, &*reporter)?;
    info!(
        target: PROCESS_TARGET,
        ?mode,
        "starting daemon runtime"
    );
    let settings = bootstrapped.settings().clone();
    let runtime_paths = RuntimePaths::from_config(bootstrapped.config())?;
    let mut guard = ProcessGuard::acquire(runtime_paths)?;
    if matches!(mode, LaunchMode::Background) {
        daemonizer.daemonize(guard.paths())?;
    }
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthState::Starting, None)?;

    let listener = bind_listener(
        &settings.listen_host,
        settings.listen_port,
        settings.listen_backlog,
    )?;
    let signals = SignalWatcher::install()?;
    let processes = SystemProcesses::new(
        settings.worker_program.clone(),
        settings.worker_config.clone(),
    );
    let pool = WorkerPool::initialise(
        processes,
        settings.resident_workers,
        settings.max_workers,
        &*reporter,
    )?;
    let mut dispatcher = Dispatcher::new(
        listener,
        pool,
        HandoffTimeouts::from(&settings),
        Arc::clone(&reporter),
    );
    guard.write_health(HealthState::Ready, Some(dispatcher.pool().active_count()))?;

    let served = dispatcher.serve(&signals);
    guard.write_health(
        HealthState::Stopping,
        Some(dispatcher.pool().active_count()),
    )?;
    dispatcher.shutdown();
    served?;

    let stats = dispatcher.stats();
    info!(
        target: PROCESS_TARGET,
        accepted = stats.accepted,
        delivered = stats.delivered,
        dropped = stats.dropped,
        elastic_spawns = stats.elastic_spawns,
        failed_handoffs = stats.failed_handoffs,
        "shutdown sequence completed"
    );
    Ok(())
}
