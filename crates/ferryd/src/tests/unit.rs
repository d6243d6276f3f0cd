//! Unit tests for the worker pool, the dispatcher and the lifecycle helpers.

use std::collections::BTreeSet;
use std::fs;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use ferry_channel::{Readiness, WorkerMode};
use ferry_config::{Config, RuntimePaths};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, raise};
use nix::unistd::Pid;
use rstest::rstest;
use tempfile::TempDir;

use crate::bootstrap::{StaticConfigLoader, bootstrap_with};
use crate::dispatch::{DispatchOutcome, DispatchStats};
use crate::lifecycle::SignalWatcher;
use crate::pool::{LiveWorker, PoolError, SlotChoice, WorkerPool, WorkerSlot, WorkerStatus};
use crate::process::daemonizer::{DaemonizeError, Daemonizer};
use crate::process::launch::{LaunchMode, LaunchPlan, run_daemon_with};

use super::support::{
    HealthEvent, RecordingHealthReporter, RunningDaemon, ThreadWorkers, dispatcher, greeting_echo,
    loopback_pair, reporting_dispatcher,
};

fn thread_pool(resident: usize, max: usize) -> WorkerPool<ThreadWorkers> {
    WorkerPool::initialise(
        ThreadWorkers::new(greeting_echo()),
        resident,
        max,
        &RecordingHealthReporter::default(),
    )
    .expect("initialise pool")
}

fn worker_pid(pool: &WorkerPool<ThreadWorkers>, index: usize) -> Pid {
    pool.slot(index)
        .and_then(WorkerSlot::worker)
        .map(LiveWorker::pid)
        .expect("slot holds a worker")
}

#[rstest]
fn initialise_fills_leading_slots() {
    let reporter = RecordingHealthReporter::default();
    let pool = WorkerPool::initialise(ThreadWorkers::new(greeting_echo()), 2, 3, &reporter)
        .expect("initialise pool");

    assert_eq!(
        pool.statuses(),
        vec![
            WorkerStatus::Starting,
            WorkerStatus::Starting,
            WorkerStatus::Terminated
        ]
    );
    assert_eq!(pool.capacity(), 3);
    assert_eq!(pool.active_count(), 2);
    assert_eq!(pool.watch_count(), 2);
    assert_eq!(
        reporter.events(),
        vec![
            HealthEvent::WorkerSpawned {
                slot: 0,
                mode: WorkerMode::Resident
            },
            HealthEvent::WorkerSpawned {
                slot: 1,
                mode: WorkerMode::Resident
            },
        ]
    );
}

#[rstest]
fn initialise_fails_when_no_worker_starts() {
    let error = WorkerPool::initialise(
        ThreadWorkers::failing(),
        2,
        4,
        &RecordingHealthReporter::default(),
    )
    .expect_err("every spawn fails");

    assert!(
        matches!(error, PoolError::NoWorkers { requested: 2 }),
        "{error:?}"
    );
}

#[rstest]
fn capacity_never_drops_below_resident_count() {
    let pool = thread_pool(3, 1);
    assert_eq!(pool.capacity(), 3);
    assert_eq!(pool.active_count(), 3);
}

#[rstest]
fn readiness_byte_turns_starting_worker_idle() {
    let mut pool = thread_pool(2, 3);
    assert_eq!(pool.find_idle_slot(&[]), Some(SlotChoice::Vacant(2)));

    let ready = pool
        .ready_slots(Duration::from_secs(1))
        .expect("readiness wait");
    assert_eq!(ready, vec![0, 1]);

    assert_eq!(
        pool.consume_readiness(0).expect("read readiness"),
        Readiness::Ready
    );
    assert_eq!(
        pool.statuses(),
        vec![
            WorkerStatus::Idle,
            WorkerStatus::Starting,
            WorkerStatus::Terminated
        ]
    );
    assert_eq!(pool.find_idle_slot(&[]), Some(SlotChoice::Idle(0)));
    assert_eq!(pool.find_idle_slot(&[0]), Some(SlotChoice::Vacant(2)));
    assert_eq!(
        pool.consume_readiness(0).expect("read readiness"),
        Readiness::Pending
    );
    assert_eq!(pool.statuses()[0], WorkerStatus::Idle);
}

#[rstest]
fn full_pool_without_idle_worker_offers_no_slot() {
    let pool = thread_pool(1, 1);
    assert_eq!(pool.find_idle_slot(&[]), None);
}

#[rstest]
#[case::occupied(0)]
#[case::out_of_range(2)]
fn spawn_into_requires_a_vacant_slot(#[case] index: usize) {
    let mut pool = thread_pool(1, 2);

    let error = pool
        .spawn_into(index, WorkerMode::Transient)
        .expect_err("slot is not vacant");

    assert!(matches!(error, PoolError::SlotTaken { index: taken } if taken == index));
    assert_eq!(pool.active_count(), 1);
}

#[rstest]
fn spawn_into_fills_the_named_slot() {
    let mut pool = thread_pool(1, 3);

    pool.spawn_into(2, WorkerMode::Transient)
        .expect("vacant slot");

    assert_eq!(
        pool.statuses(),
        vec![
            WorkerStatus::Starting,
            WorkerStatus::Terminated,
            WorkerStatus::Idle
        ]
    );
}

#[rstest]
fn spawn_is_refused_at_capacity() {
    let mut pool = thread_pool(1, 1);
    let error = pool
        .spawn(WorkerMode::Transient)
        .expect_err("pool is full");
    assert!(matches!(error, PoolError::AtCapacity { max: 1 }), "{error:?}");
    assert_eq!(pool.active_count(), 1);
}

#[rstest]
fn terminated_worker_leaves_slot_and_watch_set() {
    let mut pool = thread_pool(2, 2);
    let pid = worker_pid(&pool, 0);

    assert_eq!(pool.mark_terminated(pid), Some(0));
    assert_eq!(
        pool.statuses(),
        vec![WorkerStatus::Terminated, WorkerStatus::Starting]
    );
    assert_eq!(pool.watch_count(), 1);
    assert_eq!(
        pool.ready_slots(Duration::from_millis(200))
            .expect("readiness wait"),
        vec![1]
    );
    assert_eq!(pool.mark_terminated(Pid::from_raw(1)), None);
    assert_eq!(pool.mark_terminated(pid), None);

    let index = pool.spawn(WorkerMode::Transient).expect("elastic spawn");
    assert_eq!(index, 0);
    assert_eq!(pool.statuses()[0], WorkerStatus::Idle);
    assert_ne!(worker_pid(&pool, 0), pid);
}

#[rstest]
fn idle_residents_receive_distinct_connections() {
    let mut dispatcher = dispatcher(ThreadWorkers::new(greeting_echo()), 3, 3);
    let mut clients = Vec::new();
    let mut slots = BTreeSet::new();

    for _ in 0..3 {
        let (client, server, peer) = loopback_pair();
        match dispatcher.dispatch(server, peer) {
            DispatchOutcome::Delivered(index) => {
                slots.insert(index);
            }
            DispatchOutcome::Dropped => panic!("idle worker available"),
        }
        clients.push(client);
    }

    let greetings: BTreeSet<i32> = clients
        .iter_mut()
        .map(|client| client.greeting().expect("worker greeting"))
        .collect();
    assert_eq!(slots.len(), 3);
    assert_eq!(greetings.len(), 3);
    assert_eq!(
        dispatcher.stats(),
        DispatchStats {
            accepted: 3,
            delivered: 3,
            ..DispatchStats::default()
        }
    );

    drop(clients);
    assert_eq!(dispatcher.shutdown(), 3);
}

#[rstest]
fn resident_serves_again_after_announcing_readiness() {
    let mut dispatcher = dispatcher(ThreadWorkers::new(greeting_echo()), 1, 1);

    let (mut first, server, peer) = loopback_pair();
    assert_eq!(
        dispatcher.dispatch(server, peer),
        DispatchOutcome::Delivered(0)
    );
    let pid = first.greeting().expect("first greeting");
    assert_eq!(first.echo(b"one"), b"one");
    drop(first);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut second = loop {
        let (mut client, server, peer) = loopback_pair();
        if dispatcher.dispatch(server, peer) == DispatchOutcome::Delivered(0) {
            break client;
        }
        assert_eq!(client.greeting(), None);
        assert!(Instant::now() < deadline, "resident never became ready");
        thread::sleep(Duration::from_millis(10));
    };

    assert_eq!(second.greeting(), Some(pid));
    assert_eq!(dispatcher.stats().elastic_spawns, 0);
}

#[rstest]
fn busy_resident_triggers_one_transient() {
    let workers = ThreadWorkers::new(greeting_echo());
    let log = workers.log();
    let mut dispatcher = dispatcher(workers, 1, 2);

    let (mut first, server, peer) = loopback_pair();
    assert_eq!(
        dispatcher.dispatch(server, peer),
        DispatchOutcome::Delivered(0)
    );
    let (mut second, server, peer) = loopback_pair();
    assert_eq!(
        dispatcher.dispatch(server, peer),
        DispatchOutcome::Delivered(1)
    );

    let transients = log.lock().expect("process log poisoned").transient_pids();
    assert_eq!(transients.len(), 1);
    assert!(first.greeting().is_some());
    assert_eq!(
        second.greeting().map(Pid::from_raw),
        transients.first().copied()
    );
    assert_eq!(second.echo(b"elastic"), b"elastic");
    assert_eq!(dispatcher.stats().elastic_spawns, 1);
}

#[rstest]
fn busy_full_pool_drops_connection() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let mut dispatcher = reporting_dispatcher(
        ThreadWorkers::new(greeting_echo()),
        1,
        1,
        Arc::clone(&reporter),
    );

    let (mut first, server, peer) = loopback_pair();
    assert_eq!(
        dispatcher.dispatch(server, peer),
        DispatchOutcome::Delivered(0)
    );
    assert!(first.greeting().is_some());

    let (mut second, server, peer) = loopback_pair();
    assert_eq!(dispatcher.dispatch(server, peer), DispatchOutcome::Dropped);
    assert_eq!(second.greeting(), None);

    let stats = dispatcher.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.elastic_spawns, 0);
    assert!(
        reporter
            .events()
            .contains(&HealthEvent::ConnectionDropped { live_workers: 1 })
    );
}

#[rstest]
fn dead_transient_leaves_connection_dropped() {
    let mut dispatcher = dispatcher(ThreadWorkers::dead_on_arrival(), 1, 2);

    let (mut client, server, peer) = loopback_pair();
    assert_eq!(dispatcher.dispatch(server, peer), DispatchOutcome::Dropped);
    assert_eq!(client.greeting(), None);

    let stats = dispatcher.stats();
    assert_eq!(stats.elastic_spawns, 1);
    assert_eq!(stats.failed_handoffs, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped, 1);
}

#[rstest]
#[case::resident_only(1, 1)]
#[case::resident_and_transient(2, 2)]
fn failed_handoff_is_not_retried_on_the_same_worker(
    #[case] max: usize,
    #[case] expected_attempts: usize,
) {
    let mut dispatcher = dispatcher(ThreadWorkers::vanishing_after_announcing(), 1, max);

    let (mut client, server, peer) = loopback_pair();
    assert_eq!(dispatcher.dispatch(server, peer), DispatchOutcome::Dropped);
    assert_eq!(client.greeting(), None);

    let stats = dispatcher.stats();
    assert_eq!(stats.failed_handoffs, expected_attempts);
    assert_eq!(stats.elastic_spawns, max - 1);
    assert_eq!(dispatcher.pool().statuses().first(), Some(&WorkerStatus::Idle));
}

#[rstest]
fn burst_never_exceeds_the_maximum() {
    let workers = ThreadWorkers::new(greeting_echo());
    let log = workers.log();
    let mut dispatcher = dispatcher(workers, 1, 2);
    let mut clients = Vec::new();
    let mut outcomes = Vec::new();

    for _ in 0..3 {
        let (client, server, peer) = loopback_pair();
        outcomes.push(dispatcher.dispatch(server, peer));
        assert!(dispatcher.pool().active_count() <= 2);
        clients.push(client);
    }

    assert_eq!(
        outcomes,
        [
            DispatchOutcome::Delivered(0),
            DispatchOutcome::Delivered(1),
            DispatchOutcome::Dropped,
        ]
    );
    assert_eq!(
        log.lock().expect("process log poisoned").transient_pids().len(),
        1
    );
    let stats = dispatcher.stats();
    assert_eq!(stats.elastic_spawns, 1);
    assert_eq!(stats.dropped, 1);

    drop(clients);
    assert_eq!(dispatcher.shutdown(), 2);
}

#[rstest]
fn reaping_releases_finished_transient() {
    let reporter = Arc::new(RecordingHealthReporter::default());
    let mut dispatcher = reporting_dispatcher(
        ThreadWorkers::new(greeting_echo()),
        1,
        2,
        Arc::clone(&reporter),
    );
    let (_first, server, peer) = loopback_pair();
    dispatcher.dispatch(server, peer);
    let (mut second, server, peer) = loopback_pair();
    assert_eq!(
        dispatcher.dispatch(server, peer),
        DispatchOutcome::Delivered(1)
    );
    assert!(second.greeting().is_some());
    assert_eq!(second.echo(b"done"), b"done");

    let deadline = Instant::now() + Duration::from_secs(5);
    while dispatcher.reap() == 0 {
        assert!(Instant::now() < deadline, "transient never exited");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(dispatcher.stats().reaped, 1);
    assert_eq!(dispatcher.pool().statuses()[1], WorkerStatus::Terminated);
    assert!(
        reporter
            .events()
            .contains(&HealthEvent::WorkerTerminated { slot: 1 })
    );
}

#[rstest]
fn shutdown_cascade_runs_once() {
    let workers = ThreadWorkers::new(greeting_echo());
    let log = workers.log();
    let reporter = Arc::new(RecordingHealthReporter::default());
    let mut dispatcher = reporting_dispatcher(workers, 2, 3, Arc::clone(&reporter));

    assert_eq!(dispatcher.shutdown(), 2);
    assert_eq!(dispatcher.shutdown(), 0);

    assert!(dispatcher.local_addr().is_none());
    assert!(
        dispatcher
            .pool()
            .statuses()
            .iter()
            .all(|status| *status == WorkerStatus::Terminated)
    );
    assert_eq!(log.lock().expect("process log poisoned").terminated.len(), 2);
    let completions = reporter
        .events()
        .into_iter()
        .filter(|event| matches!(event, HealthEvent::ShutdownCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}

#[rstest]
fn dropping_dispatcher_terminates_workers() {
    let workers = ThreadWorkers::new(greeting_echo());
    let log = workers.log();
    let dispatcher = dispatcher(workers, 2, 2);

    drop(dispatcher);

    assert_eq!(log.lock().expect("process log poisoned").terminated.len(), 2);
}

#[rstest]
fn handed_off_worker_is_busy() {
    let mut pool = thread_pool(1, 2);
    let index = pool.spawn(WorkerMode::Transient).expect("elastic spawn");
    let (mut client, server, _) = loopback_pair();

    pool.hand_off(index, server.as_fd(), Duration::from_secs(1))
        .expect("handoff");
    drop(server);

    assert_eq!(pool.statuses()[index], WorkerStatus::Busy);
    assert!(client.greeting().is_some());
}

#[rstest]
fn detached_watcher_follows_its_trigger() {
    let (watcher, trigger) = SignalWatcher::detached().expect("detached watcher");
    assert!(!watcher.shutdown_requested());

    trigger.notify_child_exit();
    assert!(watcher.take_child_exit());
    assert!(!watcher.take_child_exit());

    trigger.request_shutdown();
    assert!(watcher.shutdown_requested());
    let mut fds = [PollFd::new(watcher.wake_fd(), PollFlags::POLLIN)];
    assert_eq!(poll(&mut fds, PollTimeout::ZERO).expect("poll wake"), 1);

    watcher.drain_wake();
    let mut fds = [PollFd::new(watcher.wake_fd(), PollFlags::POLLIN)];
    assert_eq!(poll(&mut fds, PollTimeout::ZERO).expect("poll wake"), 0);
}

#[rstest]
fn hangup_is_recorded_and_ignored() {
    let watcher = SignalWatcher::install().expect("install handlers");

    raise(Signal::SIGHUP).expect("raise SIGHUP");

    assert!(watcher.take_hangup());
    assert!(!watcher.shutdown_requested());
}

#[rstest]
fn serve_returns_when_shutdown_is_requested() {
    let daemon = RunningDaemon::start(1, 1);
    let (stats, statuses) = daemon.stop().expect("dispatcher thread");
    assert_eq!(stats, DispatchStats::default());
    assert_eq!(statuses.len(), 1);
}

#[rstest]
fn bootstrap_reports_validated_settings() {
    let config = Config {
        listen_port: Some(7000),
        worker_program: Some(Utf8PathBuf::from("/bin/true")),
        resident_workers: 3,
        max_workers: Some(2),
        ..Config::default()
    };
    let reporter = RecordingHealthReporter::default();

    let ready = bootstrap_with(&StaticConfigLoader::new(config), &reporter).expect("bootstrap");

    assert_eq!(ready.settings().listen_port, 7000);
    assert_eq!(ready.settings().max_workers, 3);
    assert_eq!(
        reporter.events(),
        [HealthEvent::BootstrapStarting, HealthEvent::BootstrapSucceeded]
    );
}

#[rstest]
fn bootstrap_reports_missing_key_before_failing() {
    let reporter = RecordingHealthReporter::default();

    let error = bootstrap_with(&StaticConfigLoader::new(Config::default()), &reporter)
        .expect_err("listen port is unset");

    assert_eq!(
        reporter.events(),
        [
            HealthEvent::BootstrapStarting,
            HealthEvent::BootstrapFailed(error.to_string()),
        ]
    );
    assert!(error.to_string().contains("listen_port is not configured"));
}

struct RefusingDaemonizer;

impl Daemonizer for RefusingDaemonizer {
    fn daemonize(&self, _paths: &RuntimePaths) -> Result<(), DaemonizeError> {
        panic!("foreground launch must not daemonize");
    }
}

fn foreground_plan(config: Config) -> LaunchPlan<StaticConfigLoader, RefusingDaemonizer> {
    LaunchPlan {
        mode: LaunchMode::Foreground,
        daemonizer: RefusingDaemonizer,
        loader: StaticConfigLoader::new(config),
        reporter: Arc::new(RecordingHealthReporter::default()),
    }
}

#[rstest]
#[case::missing_port(None, Some("/bin/true"), 3)]
#[case::missing_program(Some(7000), None, 4)]
fn launch_rejects_incomplete_settings(
    #[case] port: Option<u16>,
    #[case] program: Option<&str>,
    #[case] expected: u8,
) {
    let config = Config {
        listen_port: port,
        worker_program: program.map(Utf8PathBuf::from),
        ..Config::default()
    };

    let error = run_daemon_with(foreground_plan(config)).expect_err("settings incomplete");

    assert_eq!(error.exit_code(), expected);
}

#[rstest]
fn launch_without_any_worker_exits_with_status_six() {
    let temp = TempDir::new().expect("temp dir");
    let runtime = temp.path().join("run");
    let config = Config {
        listen_host: "127.0.0.1".to_owned(),
        listen_port: Some(0),
        worker_program: Some(Utf8PathBuf::from("/nonexistent/ferry-worker")),
        resident_workers: 2,
        runtime_dir: Some(Utf8PathBuf::from_path_buf(runtime.clone()).expect("utf-8 temp path")),
        ..Config::default()
    };

    let error = run_daemon_with(foreground_plan(config)).expect_err("no worker can start");

    assert_eq!(error.exit_code(), 6, "{error}");
    let leftovers = fs::read_dir(&runtime).expect("runtime dir").count();
    assert_eq!(leftovers, 0, "runtime files should be removed");
}
