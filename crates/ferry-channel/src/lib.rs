//! Control channel shared by the ferry daemon and its workers.
//!
//! Each worker owns one end of a Unix stream socket pair; the daemon keeps
//! the other. The link carries exactly two kinds of traffic:
//!
//! - a single readiness byte from worker to daemon, sent whenever a resident
//!   worker can accept its next connection;
//! - a live connection descriptor from daemon to worker, transferred as
//!   `SCM_RIGHTS` ancillary data alongside one carrier byte.
//!
//! The crate also fixes the command line a worker is started with, so the
//! daemon and worker binaries agree on it.

mod channel;
mod errors;
mod invocation;
mod wait;

pub use channel::{ControlChannel, Readiness, WorkerEnd};
pub use errors::{ChannelError, HandoffError};
pub use invocation::{CHANNEL_FD_FLAG, CONFIG_FLAG, MODE_FLAG, WorkerInvocation, WorkerMode};
