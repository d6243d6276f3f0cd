//! Test suites for the ferry daemon.

mod support;
mod unit;
