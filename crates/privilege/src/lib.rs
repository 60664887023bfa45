//! Lynx Privilege - who grants raw-socket access
//!
//! One [`PrivilegeBroker`](lynx_common::PrivilegeBroker) per platform model:
//!
//! - [`LaunchdBroker`]: a persistent system daemon registered with launchd
//! - [`CapabilityBroker`]: `cap_net_raw` file capabilities on the worker binary
//! - [`StaticBroker`]: a fixed answer where no setup workflow exists
//! - [`ProcessBroker`]: whatever the current process holds right now
//!
//! [`PlatformBroker`] names the right one for the build target.

pub mod capability;
pub mod fixed;
pub mod launchd;
pub mod process;

pub use capability::CapabilityBroker;
pub use fixed::StaticBroker;
pub use launchd::LaunchdBroker;
pub use process::{raw_socket_report, ProcessBroker};

use std::io;
use std::path::{Path, PathBuf};

/// Service label shared by the daemon, its socket, and its launchd plist.
pub const HELPER_LABEL: &str = "dev.lynx.netscan.helper";

/// Worker binary name, installed next to the app.
pub const WORKER_BINARY: &str = "lynx-worker";

#[cfg(target_os = "macos")]
pub type PlatformBroker = LaunchdBroker;

#[cfg(target_os = "linux")]
pub type PlatformBroker = CapabilityBroker;

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub type PlatformBroker = StaticBroker;

/// The broker for this platform. `worker` is the privileged binary the
/// capability model needs to inspect.
#[cfg(target_os = "macos")]
pub fn platform_broker(_worker: &Path) -> PlatformBroker {
    LaunchdBroker::new(HELPER_LABEL)
}

#[cfg(target_os = "linux")]
pub fn platform_broker(worker: &Path) -> PlatformBroker {
    CapabilityBroker::new(worker)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn platform_broker(_worker: &Path) -> PlatformBroker {
    StaticBroker::detect()
}

/// `name` in the same directory as the running executable.
pub fn sibling_binary(name: &str) -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent"))?;
    Ok(dir.join(name))
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Write an executable `/bin/sh` script under the temp dir.
    pub fn script(body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("lynx-priv-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn sibling_lives_next_to_exe() {
        let path = sibling_binary(WORKER_BINARY).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(path.parent(), exe.parent());
        assert!(path.ends_with(WORKER_BINARY));
    }
}
