//! scriptrunner -- launch Python, Bash, PowerShell and Node.js scripts and
//! watch their output live.
//!
//! This crate provides the core library: interpreter resolution, the
//! single-run process runner with classified output, per-run log files,
//! run history and the JSON config store. [`session::Session`] ties them
//! together for a front end.

pub mod classify;
pub mod config;
pub mod error;
pub mod history;
pub mod interpreter;
pub mod logwriter;
pub mod paths;
pub mod runner;
pub mod session;

pub use error::{LaunchError, PersistenceError, RunError, SessionError, TerminationError};
pub use session::{AppEvent, RunRequest, Session};
