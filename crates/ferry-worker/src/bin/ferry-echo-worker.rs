//! Echo worker started by `ferryd` for each pool slot.

use std::process::ExitCode;

use clap::Parser;
use ferry_worker::{EchoHandler, WorkerArgs, run_worker, telemetry};
use tracing::error;

fn main() -> ExitCode {
    let args = WorkerArgs::parse();
    if let Err(error) = telemetry::initialise() {
        eprintln!("ferry-echo-worker: {error}");
    }
    match run_worker(&args, &EchoHandler) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            error!(
                target: concat!(env!("CARGO_PKG_NAME"), "::worker"),
                error = %error,
                "worker failed"
            );
            ExitCode::FAILURE
        }
    }
}
