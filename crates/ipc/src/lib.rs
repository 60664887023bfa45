//! Lynx IPC - the privileged execution channel
//!
//! A Unix domain socket between the unprivileged app and `lynx-daemon`.
//! Frames are JSON Lines: the client sends `{ id, call }`, the daemon answers
//! with frames carrying the same `id`. Discover and scan calls stream the
//! worker's result lines back verbatim as `progress` frames and end with a
//! `completion` frame.
//!
//! Every connection is authenticated from its peer credentials before a
//! single frame is read.

pub mod auth;
pub mod broker;
pub mod client;
pub mod executor;
pub mod protocol;
pub mod server;

pub use auth::{AllOf, CallerVerifier, ExecutableVerifier, PeerCredentials, UidVerifier};
pub use broker::DaemonBroker;
pub use client::{IpcClient, PrivilegeCheck, RemoteOperation, DEFAULT_CEILING};
pub use executor::IpcExecutor;
pub use protocol::{default_socket_path, Call, Reply, Request, Response, SOCKET_ENV};
pub use server::IpcServer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use lynx_supervisor::WorkerBinary;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Fresh socket path under the temp dir.
    pub fn socket_path() -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        std::env::temp_dir().join(format!("lynx-{}.sock", &id[..12]))
    }

    /// A `/bin/sh` script standing in for `lynx-worker`.
    pub fn sh_worker(body: &str) -> WorkerBinary {
        let path = std::env::temp_dir().join(format!("lynx-ipc-worker-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        WorkerBinary::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
