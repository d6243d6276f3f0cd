//! Error types for control channel operations.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

/// Failures creating or servicing a control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The socket pair could not be created or configured.
    #[error("failed to create control channel: {source}")]
    Create {
        /// Underlying system error.
        #[source]
        source: io::Error,
    },
    /// An inherited descriptor number does not refer to an open descriptor.
    #[error("descriptor {fd} is not an open control channel: {source}")]
    InvalidDescriptor {
        /// Descriptor number supplied on the command line.
        fd: RawFd,
        /// Underlying system error.
        #[source]
        source: io::Error,
    },
    /// Reading or writing a readiness byte failed.
    #[error("control channel I/O failed: {source}")]
    Io {
        /// Underlying system error.
        #[source]
        source: io::Error,
    },
}

/// Failures transferring a connection descriptor across a channel.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The peer did not become ready within the allotted time.
    #[error("descriptor transfer timed out after {timeout:?}")]
    Timeout {
        /// Time waited before giving up.
        timeout: Duration,
    },
    /// The peer closed its end of the channel.
    #[error("control channel closed by peer")]
    Closed,
    /// A message arrived without an attached descriptor.
    #[error("control message carried no descriptor")]
    MissingDescriptor,
    /// The transfer failed at the system call level.
    #[error("descriptor transfer failed: {source}")]
    Io {
        /// Underlying system error.
        #[source]
        source: io::Error,
    },
}

impl HandoffError {
    /// Returns `true` when the peer is gone and the channel is unusable.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
