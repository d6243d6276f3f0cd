//! Resident and transient run loops.

use std::io;
use std::net::TcpStream;

use ferry_channel::{ChannelError, ControlChannel, HandoffError, WorkerMode};
use thiserror::Error;
use tracing::{debug, info};

use crate::args::WorkerArgs;
use crate::handler::ConnectionHandler;

pub(crate) const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");

/// Errors that end a worker before the daemon releases it.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The inherited channel could not be adopted or written.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Receiving a connection descriptor failed.
    #[error("failed to receive connection: {0}")]
    Receive(#[source] HandoffError),
}

/// Adopts the channel named by `args` and serves connections until released.
///
/// Returns the number of connections served. Call at most once per process:
/// the channel descriptor is owned by the returned loop and closed when it
/// ends.
pub fn run_worker<H>(args: &WorkerArgs, handler: &H) -> Result<usize, WorkerError>
where
    H: ConnectionHandler + ?Sized,
{
    // SAFETY: the daemon passes the inherited channel descriptor on the
    // command line and nothing else in this process refers to it.
    let channel = unsafe { ControlChannel::from_inherited(args.channel_fd) }?;
    info!(
        target: WORKER_TARGET,
        mode = %args.mode,
        channel_fd = args.channel_fd,
        config = args.config.as_ref().map(|path| path.as_str()),
        "worker started"
    );
    let served = serve(&channel, args.mode, handler)?;
    info!(
        target: WORKER_TARGET,
        mode = %args.mode,
        served,
        "worker exiting"
    );
    Ok(served)
}

/// Runs the worker loop for `mode` over an adopted channel.
///
/// Resident workers keep serving until the daemon closes the channel.
/// Transient workers serve at most one connection. Both treat a closed
/// channel as an orderly release.
pub fn serve<H>(channel: &ControlChannel, mode: WorkerMode, handler: &H) -> Result<usize, WorkerError>
where
    H: ConnectionHandler + ?Sized,
{
    match mode {
        WorkerMode::Resident => serve_resident(channel, handler),
        WorkerMode::Transient => serve_transient(channel, handler),
    }
}

fn serve_resident<H>(channel: &ControlChannel, handler: &H) -> Result<usize, WorkerError>
where
    H: ConnectionHandler + ?Sized,
{
    let mut served = 0;
    loop {
        match channel.signal_ready() {
            Ok(()) => {}
            Err(ChannelError::Io { source }) if is_disconnect(&source) => {
                debug!(target: WORKER_TARGET, "daemon closed control channel");
                return Ok(served);
            }
            Err(error) => return Err(error.into()),
        }
        if !receive_and_handle(channel, handler)? {
            return Ok(served);
        }
        served += 1;
    }
}

fn serve_transient<H>(channel: &ControlChannel, handler: &H) -> Result<usize, WorkerError>
where
    H: ConnectionHandler + ?Sized,
{
    let served = receive_and_handle(channel, handler)?;
    Ok(usize::from(served))
}

/// Returns `false` when the daemon closed the channel instead of sending a
/// connection.
fn receive_and_handle<H>(channel: &ControlChannel, handler: &H) -> Result<bool, WorkerError>
where
    H: ConnectionHandler + ?Sized,
{
    let descriptor = match channel.receive_descriptor(None) {
        Ok(descriptor) => descriptor,
        Err(HandoffError::Closed) => {
            debug!(target: WORKER_TARGET, "daemon closed control channel");
            return Ok(false);
        }
        Err(error) => return Err(WorkerError::Receive(error)),
    };
    let stream = TcpStream::from(descriptor);
    let peer = stream.peer_addr().ok();
    debug!(
        target: WORKER_TARGET,
        peer = ?peer,
        "connection received"
    );
    handler.handle(stream);
    Ok(true)
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}
