//! In-process worker backend and helpers shared by the dispatcher suites.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use ferry_channel::{ControlChannel, WorkerEnd, WorkerMode};
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::bootstrap::BootstrapError;
use crate::dispatch::{DispatchStats, Dispatcher, HandoffTimeouts};
use crate::health::HealthReporter;
use crate::lifecycle::{SignalTrigger, SignalWatcher};
use crate::listener::bind_listener;
use crate::pool::{WorkerPool, WorkerStatus};
use crate::processes::{SpawnError, WorkerProcesses};
use crate::settings::DispatchSettings;

/// Serves one connection on behalf of the worker with the given pid.
pub type Handler = Arc<dyn Fn(TcpStream, Pid) + Send + Sync>;

const FIRST_PID: i32 = 40_000;

/// Processes started and signalled through a [`ThreadWorkers`] backend.
#[derive(Debug, Default)]
pub struct ProcessLog {
    pub spawned: Vec<(Pid, WorkerMode)>,
    pub terminated: Vec<Pid>,
}

impl ProcessLog {
    pub fn transient_pids(&self) -> Vec<Pid> {
        self.spawned
            .iter()
            .filter(|(_, mode)| *mode == WorkerMode::Transient)
            .map(|(pid, _)| *pid)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Serve,
    FailSpawn,
    DeadOnArrival,
    VanishAfterAnnouncing,
}

/// Worker backend that runs every worker as a thread of the test process.
///
/// Thread workers follow the worker protocol over a real control channel:
/// residents announce readiness, receive, serve and announce again until the
/// channel closes; transients serve a single connection. Pids are synthetic.
pub struct ThreadWorkers {
    behaviour: Behaviour,
    handler: Handler,
    next_pid: i32,
    running: Vec<(Pid, JoinHandle<()>)>,
    exited: Arc<Mutex<Vec<Pid>>>,
    log: Arc<Mutex<ProcessLog>>,
}

impl fmt::Debug for ThreadWorkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorkers")
            .field("behaviour", &self.behaviour)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl ThreadWorkers {
    pub fn new(handler: Handler) -> Self {
        Self {
            behaviour: Behaviour::Serve,
            handler,
            next_pid: FIRST_PID,
            running: Vec::new(),
            exited: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(ProcessLog::default())),
        }
    }

    /// Backend whose every spawn fails.
    pub fn failing() -> Self {
        Self {
            behaviour: Behaviour::FailSpawn,
            ..Self::new(greeting_echo())
        }
    }

    /// Backend whose workers close their channel as soon as they start.
    pub fn dead_on_arrival() -> Self {
        Self {
            behaviour: Behaviour::DeadOnArrival,
            ..Self::new(greeting_echo())
        }
    }

    /// Backend whose residents queue two readiness bytes and then close
    /// their channel, so every handoff to them fails while a byte is still
    /// waiting. Transients close their channel at once.
    pub fn vanishing_after_announcing() -> Self {
        Self {
            behaviour: Behaviour::VanishAfterAnnouncing,
            ..Self::new(greeting_echo())
        }
    }

    pub fn log(&self) -> Arc<Mutex<ProcessLog>> {
        Arc::clone(&self.log)
    }

    fn launch_error(message: &str) -> SpawnError {
        SpawnError::Launch {
            program: Utf8PathBuf::from("thread-worker"),
            source: io::Error::other(message.to_owned()),
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        pid
    }
}

impl WorkerProcesses for ThreadWorkers {
    fn spawn(&mut self, mode: WorkerMode, channel: WorkerEnd) -> Result<Pid, SpawnError> {
        match self.behaviour {
            Behaviour::FailSpawn => return Err(Self::launch_error("spawning disabled")),
            Behaviour::DeadOnArrival | Behaviour::VanishAfterAnnouncing => {
                if self.behaviour == Behaviour::VanishAfterAnnouncing
                    && mode == WorkerMode::Resident
                {
                    let channel = channel
                        .into_channel()
                        .map_err(|error| Self::launch_error(&error.to_string()))?;
                    for _ in 0..2 {
                        channel
                            .signal_ready()
                            .map_err(|error| Self::launch_error(&error.to_string()))?;
                    }
                } else {
                    drop(channel);
                }
                let pid = self.allocate_pid();
                self.log
                    .lock()
                    .expect("process log poisoned")
                    .spawned
                    .push((pid, mode));
                self.exited.lock().expect("exit list poisoned").push(pid);
                return Ok(pid);
            }
            Behaviour::Serve => {}
        }

        let channel = channel
            .into_channel()
            .map_err(|error| Self::launch_error(&error.to_string()))?;
        if mode == WorkerMode::Resident {
            channel
                .signal_ready()
                .map_err(|error| Self::launch_error(&error.to_string()))?;
        }
        let pid = self.allocate_pid();
        let handler = Arc::clone(&self.handler);
        let exited = Arc::clone(&self.exited);
        let handle = thread::spawn(move || {
            run_thread_worker(&channel, mode, pid, &handler);
            exited.lock().expect("exit list poisoned").push(pid);
        });
        self.running.push((pid, handle));
        self.log
            .lock()
            .expect("process log poisoned")
            .spawned
            .push((pid, mode));
        Ok(pid)
    }

    fn terminate(&mut self, pid: Pid) -> Result<(), Errno> {
        self.log
            .lock()
            .expect("process log poisoned")
            .terminated
            .push(pid);
        Ok(())
    }

    fn reap_exited(&mut self) -> Vec<Pid> {
        let exited: Vec<Pid> = self
            .exited
            .lock()
            .expect("exit list poisoned")
            .drain(..)
            .collect();
        let (finished, running): (Vec<_>, Vec<_>) = self
            .running
            .drain(..)
            .partition(|(pid, _)| exited.contains(pid));
        self.running = running;
        for (_, handle) in finished {
            handle.join().expect("thread worker panicked");
        }
        exited
    }

    fn wait_all(&mut self) -> usize {
        let running = std::mem::take(&mut self.running);
        let collected = running.len();
        for (_, handle) in running {
            handle.join().expect("thread worker panicked");
        }
        self.exited.lock().expect("exit list poisoned").clear();
        collected
    }
}

fn run_thread_worker(channel: &ControlChannel, mode: WorkerMode, pid: Pid, handler: &Handler) {
    match mode {
        WorkerMode::Resident => loop {
            let Ok(descriptor) = channel.receive_descriptor(None) else {
                return;
            };
            handler(TcpStream::from(descriptor), pid);
            if channel.signal_ready().is_err() {
                return;
            }
        },
        WorkerMode::Transient => {
            if let Ok(descriptor) = channel.receive_descriptor(None) {
                handler(TcpStream::from(descriptor), pid);
            }
        }
    }
}

/// Greets each client with the serving worker's pid, then echoes until the
/// client closes its side.
pub fn greeting_echo() -> Handler {
    Arc::new(|mut stream: TcpStream, pid: Pid| {
        if writeln!(stream, "{}", pid.as_raw()).is_err() {
            return;
        }
        let mut buffer = [0_u8; 1024];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if stream.write_all(&buffer[..read]).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stream.shutdown(Shutdown::Write);
    })
}

/// Client side of a dispatched connection.
pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).expect("connect client");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone client stream"));
        Self { stream, reader }
    }

    /// Reads the worker greeting; `None` when the daemon closed the
    /// connection instead.
    pub fn greeting(&mut self) -> Option<i32> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => line.trim().parse().ok(),
        }
    }

    /// Sends `payload`, closes the write side and returns everything echoed.
    pub fn echo(&mut self, payload: &[u8]) -> Vec<u8> {
        self.stream.write_all(payload).expect("write payload");
        self.stream
            .shutdown(Shutdown::Write)
            .expect("shutdown client write");
        let mut echoed = Vec::new();
        self.reader.read_to_end(&mut echoed).expect("read echo");
        echoed
    }
}

/// Builds a loopback connection pair: the client end and the accepted end
/// with its peer address.
pub fn loopback_pair() -> (Client, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let address = listener.local_addr().expect("loopback address");
    let client = Client::connect(address);
    let (server, peer) = listener.accept().expect("accept loopback");
    (client, server, peer)
}

pub fn test_timeouts() -> HandoffTimeouts {
    HandoffTimeouts {
        handoff: Duration::from_secs(1),
        spawn_grace: Duration::from_millis(50),
    }
}

/// Dispatcher over thread workers, not yet serving.
pub fn dispatcher(
    workers: ThreadWorkers,
    resident: usize,
    max: usize,
) -> Dispatcher<ThreadWorkers> {
    reporting_dispatcher(
        workers,
        resident,
        max,
        Arc::new(RecordingHealthReporter::default()),
    )
}

/// Dispatcher over thread workers that reports into `reporter`.
pub fn reporting_dispatcher(
    workers: ThreadWorkers,
    resident: usize,
    max: usize,
    reporter: Arc<RecordingHealthReporter>,
) -> Dispatcher<ThreadWorkers> {
    let listener = bind_listener("127.0.0.1", 0, 16).expect("bind listener");
    let pool =
        WorkerPool::initialise(workers, resident, max, &*reporter).expect("initialise pool");
    Dispatcher::new(listener, pool, test_timeouts(), reporter)
}

/// Dispatcher serving on a background thread.
pub struct RunningDaemon {
    address: SocketAddr,
    trigger: SignalTrigger,
    log: Arc<Mutex<ProcessLog>>,
    handle: Option<JoinHandle<(DispatchStats, Vec<WorkerStatus>)>>,
}

impl RunningDaemon {
    pub fn start(resident: usize, max: usize) -> Self {
        let workers = ThreadWorkers::new(greeting_echo());
        let log = workers.log();
        let mut dispatcher = dispatcher(workers, resident, max);
        let address = dispatcher.local_addr().expect("listener address");
        let (signals, trigger) = SignalWatcher::detached().expect("detached watcher");
        let handle = thread::spawn(move || {
            dispatcher.serve(&signals).expect("dispatcher serve");
            let statuses = dispatcher.pool().statuses();
            dispatcher.shutdown();
            (dispatcher.stats(), statuses)
        });
        Self {
            address,
            trigger,
            log,
            handle: Some(handle),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn log(&self) -> &Arc<Mutex<ProcessLog>> {
        &self.log
    }

    /// Requests shutdown and returns the final totals together with the
    /// slot statuses seen just before the cascade.
    pub fn stop(mut self) -> Option<(DispatchStats, Vec<WorkerStatus>)> {
        self.finish()
    }

    fn finish(&mut self) -> Option<(DispatchStats, Vec<WorkerStatus>)> {
        let handle = self.handle.take()?;
        self.trigger.request_shutdown();
        handle.join().ok()
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _settings: &DispatchSettings) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn worker_spawned(&self, slot: usize, _pid: Pid, mode: WorkerMode) {
        self.record(HealthEvent::WorkerSpawned { slot, mode });
    }

    fn worker_terminated(&self, slot: usize, _pid: Pid) {
        self.record(HealthEvent::WorkerTerminated { slot });
    }

    fn connection_dropped(&self, _peer: SocketAddr, live_workers: usize) {
        self.record(HealthEvent::ConnectionDropped { live_workers });
    }

    fn shutdown_completed(&self, signalled: usize) {
        self.record(HealthEvent::ShutdownCompleted { signalled });
    }
}

/// Health events tracked during tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BootstrapStarting,
    BootstrapSucceeded,
    BootstrapFailed(String),
    WorkerSpawned { slot: usize, mode: WorkerMode },
    WorkerTerminated { slot: usize },
    ConnectionDropped { live_workers: usize },
    ShutdownCompleted { signalled: usize },
}
