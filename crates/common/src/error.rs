//! Error types for the Lynx discovery core
//!
//! Each failure scope has its own enum so callers can attribute a failure to
//! the narrowest scope: a driver, a setup attempt, the IPC channel, or a
//! worker process. Per-target failures have no type; drivers swallow them.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid target, port, or method notation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid address block: {0}")]
    InvalidBlock(String),

    #[error("invalid port range: {0}")]
    InvalidPort(String),

    #[error("unknown discovery method: {0}")]
    UnknownMethod(String),

    #[error("{block} expands to {count} hosts which exceeds the limit of {limit}")]
    TooLarge { block: String, count: u128, limit: u128 },

    #[error("invalid scan option: {0}")]
    InvalidOption(String),
}

/// Total failure of one discovery driver.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("driver failed: {0}")]
    Failed(String),
}

impl DriverError {
    /// Classify a socket creation error: EPERM/EACCES become `PermissionDenied`.
    #[must_use]
    pub fn from_socket_error(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                DriverError::PermissionDenied(format!("{context}: {err}"))
            }
            _ if err.raw_os_error() == Some(1) => {
                DriverError::PermissionDenied(format!("{context}: {err}"))
            }
            _ => DriverError::Io(err),
        }
    }
}

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Privilege elevation request failed or was declined.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("setup declined: {0}")]
    Declined(String),

    #[error("elevation agent unavailable: {0}")]
    Unavailable(String),

    #[error("binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("setup not supported: {0}")]
    Unsupported(String),

    #[error("setup failed: {0}")]
    Failed(String),
}

/// Failure talking to the privileged daemon.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("cannot connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("caller rejected: {0}")]
    Rejected(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("operation exceeded the {}s ceiling", .0.as_secs())]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Worker subprocess failure.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write request to worker stdin: {0}")]
    Stdin(io::Error),

    #[error("operation {0} is already running")]
    Duplicate(String),

    #[error("{}", exit_message(.code))]
    Exit { code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn exit_message(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("worker exited with code {code}"),
        None => "worker terminated by signal".to_string(),
    }
}

/// JSON Lines framing failure.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
