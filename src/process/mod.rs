//! Host process ownership.
//!
//! - `runner`: [`ProcessRunner`], the only owner of a live host process
//! - `env`: settings → environment translation

pub mod env;
pub mod runner;

pub use runner::{JobRunner, ProcessRunner, ProcessRunnerFactory, RunnerFactory, RunnerOptions};
