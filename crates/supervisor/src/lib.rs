//! Lynx Supervisor - owns privileged worker processes
//!
//! Spawns the worker over stdio pipes, feeds it one request line, streams
//! its stdout as results and its stderr as log lines, and turns its exit
//! into a [`Completion`](lynx_common::Completion). Each process is tied to
//! an operation ID and can be cancelled by it.

mod executor;
mod supervisor;

pub use executor::SubprocessExecutor;
pub use supervisor::{ProcessHandle, Supervisor, WorkerBinary};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
