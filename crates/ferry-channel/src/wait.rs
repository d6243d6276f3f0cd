//! Bounded readiness waits shared by both channel ends.

use std::io;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Waits until `fd` reports any of `events` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. Hang-up and error conditions count as
/// ready so the caller observes them through its next read or write.
/// Interrupted waits resume with the remaining time.
pub(crate) fn wait_for(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    loop {
        let poll_timeout = deadline.map_or(PollTimeout::NONE, |at| {
            let remaining = at.saturating_duration_since(Instant::now());
            PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX)
        });
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}
