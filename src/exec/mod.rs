// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`executor`] claims a task instance through the state store, runs one
//!   attempt of its callable and records the outcome (success, deferred
//!   retry or permanent failure).
//! - [`command`] provides [`ShellCommand`], the callable used for tasks
//!   defined in the TOML config.

pub mod command;
pub mod executor;

pub use command::ShellCommand;
pub use executor::{ExecOutcome, Executor};
