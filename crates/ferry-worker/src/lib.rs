//! Worker side of the ferry connection handoff.
//!
//! A worker is started by `ferryd` with one end of a control channel
//! inherited on a numbered descriptor. Resident workers announce readiness,
//! receive a connection, serve it, and announce readiness again until the
//! daemon closes the channel. Transient workers serve the single connection
//! handed to them at spawn time and exit.
//!
//! The protocol work is delegated to a [`ConnectionHandler`]; the crate ships
//! an [`EchoHandler`] used by the `ferry-echo-worker` binary.

mod args;
mod handler;
mod runtime;
pub mod telemetry;

pub use args::WorkerArgs;
pub use handler::{ConnectionHandler, EchoHandler};
pub use runtime::{WorkerError, run_worker, serve};
