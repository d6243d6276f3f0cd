//! Socket-pair link between the daemon and a single worker.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::poll::PollFlags;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

use crate::errors::{ChannelError, HandoffError};
use crate::wait::wait_for;

const READY_BYTE: u8 = b'R';
/// Lowest descriptor a worker end may occupy; the child's standard streams
/// are installed over 0, 1 and 2 before the channel is inherited.
const FIRST_NON_STDIO_FD: RawFd = 3;
const CARRIER_BYTE: u8 = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const PAIR_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PAIR_FLAGS: SockFlag = SockFlag::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Outcome of a non-blocking readiness read on the daemon end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// One readiness byte was consumed; the worker is waiting for a
    /// descriptor.
    Ready,
    /// No byte is queued yet.
    Pending,
    /// The worker closed its end or exited.
    Closed,
}

/// One end of a worker control channel.
///
/// The daemon end produced by [`ControlChannel::pair`] is non-blocking; the
/// worker end is blocking. Both close their descriptor on drop.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
}

/// Worker half of a freshly created pair, not yet handed to a process.
///
/// The descriptor is close-on-exec; the spawner clears that flag in the
/// child only, so the daemon never leaks it into unrelated programs.
#[derive(Debug)]
pub struct WorkerEnd {
    fd: OwnedFd,
}

impl ControlChannel {
    /// Creates a connected pair and returns the daemon end and the worker
    /// end.
    ///
    /// The worker end never sits on a standard stream number, even when the
    /// daemon was started with one of them closed.
    pub fn pair() -> Result<(Self, WorkerEnd), ChannelError> {
        let (daemon, worker) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, PAIR_FLAGS)
                .map_err(|errno| ChannelError::Create {
                    source: io::Error::from(errno),
                })?;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in [&daemon, &worker] {
            mark_close_on_exec(fd.as_raw_fd()).map_err(|source| ChannelError::Create { source })?;
        }
        let stream = UnixStream::from(daemon);
        stream
            .set_nonblocking(true)
            .map_err(|source| ChannelError::Create { source })?;
        let worker =
            lift_above(worker, FIRST_NON_STDIO_FD).map_err(|source| ChannelError::Create { source })?;
        Ok((Self { stream }, WorkerEnd { fd: worker }))
    }

    /// Adopts a channel descriptor inherited from the daemon.
    ///
    /// The descriptor is validated, marked close-on-exec so it does not
    /// leak into programs the worker starts, and switched to blocking mode.
    ///
    /// # Safety
    ///
    /// `fd` must be owned by the caller and not wrapped by any other owner;
    /// the returned channel closes it on drop.
    pub unsafe fn from_inherited(fd: RawFd) -> Result<Self, ChannelError> {
        fcntl(fd, FcntlArg::F_GETFD).map_err(|errno| ChannelError::InvalidDescriptor {
            fd,
            source: io::Error::from(errno),
        })?;
        mark_close_on_exec(fd).map_err(|source| ChannelError::InvalidDescriptor { fd, source })?;
        // SAFETY: the descriptor is open and the caller guarantees exclusive
        // ownership.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let stream = UnixStream::from(owned);
        stream
            .set_nonblocking(false)
            .map_err(|source| ChannelError::InvalidDescriptor { fd, source })?;
        Ok(Self { stream })
    }

    /// Announces that the worker can accept its next connection.
    pub fn signal_ready(&self) -> Result<(), ChannelError> {
        (&self.stream)
            .write_all(&[READY_BYTE])
            .map_err(|source| ChannelError::Io { source })
    }

    /// Consumes exactly one readiness byte if one is queued.
    ///
    /// Interrupted reads are retried. End-of-file, a reset and a broken
    /// pipe all report [`Readiness::Closed`].
    pub fn read_ready(&self) -> Result<Readiness, ChannelError> {
        let mut byte = [0_u8; 1];
        loop {
            match (&self.stream).read(&mut byte) {
                Ok(0) => return Ok(Readiness::Closed),
                Ok(_) => return Ok(Readiness::Ready),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Readiness::Pending);
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(Readiness::Closed);
                }
                Err(source) => return Err(ChannelError::Io { source }),
            }
        }
    }

    /// Transfers `descriptor` to the peer as `SCM_RIGHTS` ancillary data.
    ///
    /// Waits at most `timeout` for the channel to become writable. The
    /// caller keeps its own copy of the descriptor and closes it once the
    /// transfer has succeeded or been abandoned.
    pub fn send_descriptor(
        &self,
        descriptor: BorrowedFd<'_>,
        timeout: Duration,
    ) -> Result<(), HandoffError> {
        let deadline = Instant::now() + timeout;
        let carrier = [CARRIER_BYTE];
        let iov = [IoSlice::new(&carrier)];
        let fds = [descriptor.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let writable = wait_for(self.stream.as_fd(), PollFlags::POLLOUT, Some(remaining))
                .map_err(|source| HandoffError::Io { source })?;
            if !writable {
                return Err(HandoffError::Timeout { timeout });
            }
            match sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR | Errno::EAGAIN) => {}
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(HandoffError::Closed),
                Err(errno) => {
                    return Err(HandoffError::Io {
                        source: io::Error::from(errno),
                    });
                }
            }
        }
    }

    /// Receives one descriptor from the peer.
    ///
    /// With `timeout` set the call waits at most that long for a message;
    /// `None` blocks until one arrives or the peer closes the channel.
    pub fn receive_descriptor(&self, timeout: Option<Duration>) -> Result<OwnedFd, HandoffError> {
        if let Some(limit) = timeout {
            let readable = wait_for(self.stream.as_fd(), PollFlags::POLLIN, Some(limit))
                .map_err(|source| HandoffError::Io { source })?;
            if !readable {
                return Err(HandoffError::Timeout { timeout: limit });
            }
        }

        let mut carrier = [0_u8; 1];
        let mut space = cmsg_space!(RawFd);
        loop {
            let mut iov = [IoSliceMut::new(&mut carrier)];
            match recvmsg::<()>(self.stream.as_raw_fd(), &mut iov, Some(&mut space), RECV_FLAGS) {
                Ok(message) => {
                    if message.bytes == 0 {
                        return Err(HandoffError::Closed);
                    }
                    let cmsgs = message.cmsgs().map_err(|errno| HandoffError::Io {
                        source: io::Error::from(errno),
                    })?;
                    return take_first_descriptor(cmsgs);
                }
                Err(Errno::EINTR | Errno::EAGAIN) => {}
                Err(Errno::ECONNRESET) => return Err(HandoffError::Closed),
                Err(errno) => {
                    return Err(HandoffError::Io {
                        source: io::Error::from(errno),
                    });
                }
            }
        }
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl WorkerEnd {
    /// Converts the worker half into a blocking channel in this process.
    ///
    /// Used when the worker side runs in-process rather than in a spawned
    /// program.
    pub fn into_channel(self) -> Result<ControlChannel, ChannelError> {
        let stream = UnixStream::from(self.fd);
        stream
            .set_nonblocking(false)
            .map_err(|source| ChannelError::Io { source })?;
        Ok(ControlChannel { stream })
    }
}

impl AsFd for WorkerEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for WorkerEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn mark_close_on_exec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(io::Error::from)
}

/// Moves `fd` to the lowest free number at or above `floor`, keeping it
/// close-on-exec.
fn lift_above(fd: OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() >= floor {
        return Ok(fd);
    }
    let lifted = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    // SAFETY: `F_DUPFD_CLOEXEC` returned a fresh descriptor owned by nobody
    // else; the original closes when `fd` drops.
    Ok(unsafe { OwnedFd::from_raw_fd(lifted) })
}

fn take_first_descriptor(
    cmsgs: impl Iterator<Item = ControlMessageOwned>,
) -> Result<OwnedFd, HandoffError> {
    let mut received = Vec::new();
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: the kernel installed these descriptors for this
            // process and nothing else refers to them yet.
            received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    // Extra descriptors are closed when `received` drops.
    let mut descriptors = received.into_iter();
    descriptors.next().ok_or(HandoffError::MissingDescriptor)
}
