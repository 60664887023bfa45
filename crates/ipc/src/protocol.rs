//! Frame shapes on the daemon socket
//!
//! ```text
//! -> {"id":1,"call":{"method":"ping"}}
//! <- {"id":1,"reply":{"kind":"pong"}}
//! -> {"id":2,"call":{"method":"discover","operationId":"...","targetSpec":{...},"methods":[...]}}
//! <- {"id":2,"reply":{"kind":"progress","line":"{\"type\":\"host\",...}"}}
//! <- {"id":2,"reply":{"kind":"completion","ok":true,"errorMessage":null}}
//! ```

use lynx_common::{Completion, ScanRequest};
use lynx_privilege::HELPER_LABEL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "LYNX_HELPER_SOCKET";

/// Frame ID the daemon uses for connection-level replies.
pub const CONNECTION_FRAME: u64 = 0;

/// `/var/run/<label>.sock`, unless `LYNX_HELPER_SOCKET` is set.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os(SOCKET_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(format!("/var/run/{HELPER_LABEL}.sock")),
    }
}

/// Client to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Ping,
    CheckPrivileges,
    Discover(ScanRequest),
    Scan(ScanRequest),
    #[serde(rename_all = "camelCase")]
    Cancel { operation_id: String },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Ping => "ping",
            Call::CheckPrivileges => "check_privileges",
            Call::Discover(_) => "discover",
            Call::Scan(_) => "scan",
            Call::Cancel { .. } => "cancel",
        }
    }
}

/// Daemon to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub reply: Reply,
}

impl Response {
    pub fn new(id: u64, reply: Reply) -> Self {
        Self { id, reply }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Pong,
    #[serde(rename_all = "camelCase")]
    Privileges {
        ok: bool,
        is_privileged: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// One worker stdout line, untouched.
    Progress { line: String },
    Completion(Completion),
    Cancelled { cancelled: bool },
    /// The caller failed authentication; the connection closes next.
    Rejected { reason: String },
    /// The frame could not be understood.
    Error { message: String },
}

impl Reply {
    /// Whether no further frames follow for this ID.
    pub fn is_final(&self) -> bool {
        !matches!(self, Reply::Progress { .. })
    }
}
