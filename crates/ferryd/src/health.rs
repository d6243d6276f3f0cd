//! Structured health reporting for daemon lifecycle events.

use std::net::SocketAddr;
use std::sync::Arc;

use ferry_channel::WorkerMode;
use nix::unistd::Pid;

use crate::bootstrap::BootstrapError;
use crate::settings::DispatchSettings;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer notified of lifecycle events worth surfacing to operators.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after configuration and telemetry are ready.
    fn bootstrap_succeeded(&self, settings: &DispatchSettings);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked after a worker process starts.
    fn worker_spawned(&self, slot: usize, pid: Pid, mode: WorkerMode);

    /// Invoked after a worker has been reaped.
    fn worker_terminated(&self, slot: usize, pid: Pid);

    /// Invoked when a connection is closed without reaching a worker.
    fn connection_dropped(&self, peer: SocketAddr, live_workers: usize);

    /// Invoked once the shutdown cascade has finished.
    fn shutdown_completed(&self, signalled: usize);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, settings: &DispatchSettings) {
        (**self).bootstrap_succeeded(settings);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn worker_spawned(&self, slot: usize, pid: Pid, mode: WorkerMode) {
        (**self).worker_spawned(slot, pid, mode);
    }

    fn worker_terminated(&self, slot: usize, pid: Pid) {
        (**self).worker_terminated(slot, pid);
    }

    fn connection_dropped(&self, peer: SocketAddr, live_workers: usize) {
        (**self).connection_dropped(peer, live_workers);
    }

    fn shutdown_completed(&self, signalled: usize) {
        (**self).shutdown_completed(signalled);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, settings: &DispatchSettings) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            host = %settings.listen_host,
            port = settings.listen_port,
            worker_program = %settings.worker_program,
            resident_workers = settings.resident_workers,
            max_workers = settings.max_workers,
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn worker_spawned(&self, slot: usize, pid: Pid, mode: WorkerMode) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "worker_spawned",
            slot,
            pid = pid.as_raw(),
            mode = %mode,
            "worker started"
        );
    }

    fn worker_terminated(&self, slot: usize, pid: Pid) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "worker_terminated",
            slot,
            pid = pid.as_raw(),
            "worker reaped"
        );
    }

    fn connection_dropped(&self, peer: SocketAddr, live_workers: usize) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "connection_dropped",
            peer = %peer,
            live_workers,
            "connection dropped without a worker"
        );
    }

    fn shutdown_completed(&self, signalled: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "shutdown_completed",
            signalled,
            "worker pool shut down"
        );
    }
}
