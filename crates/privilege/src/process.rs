//! Privilege held by the running process

use async_trait::async_trait;
use lynx_common::{PrivilegeBroker, PrivilegeReport, PrivilegeState, SetupError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;

/// Whether this process can open raw sockets right now: effective uid 0, or
/// a successful raw ICMP socket (CAP_NET_RAW, setuid, ...).
pub fn raw_socket_report() -> PrivilegeReport {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PrivilegeReport::granted().with_reason("running as root");
        }
    }

    match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(_) => PrivilegeReport::granted().with_reason("raw sockets permitted"),
        Err(e) if e.kind() == ErrorKind::PermissionDenied || e.raw_os_error() == Some(1) => {
            PrivilegeReport::new(PrivilegeState::NotRegistered)
                .with_reason(format!("raw sockets not permitted: {e}"))
        }
        Err(e) => PrivilegeReport::new(PrivilegeState::NotRegistered)
            .with_reason(format!("raw socket probe failed: {e}")),
    }
}

/// Reports on the current process. Used by the worker and the daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBroker;

impl ProcessBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PrivilegeBroker for ProcessBroker {
    async fn check_privilege(&self) -> PrivilegeReport {
        raw_socket_report()
    }

    async fn request_setup(&self) -> Result<(), SetupError> {
        Err(SetupError::Unsupported(
            "a running process cannot elevate itself".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broker_matches_direct_probe() {
        let direct = raw_socket_report();
        let via_broker = ProcessBroker::new().check_privilege().await;
        assert_eq!(direct.state, via_broker.state);
        assert!(matches!(
            direct.state,
            PrivilegeState::Granted | PrivilegeState::NotRegistered
        ));
        assert!(direct.reason.is_some());
    }

    #[tokio::test]
    async fn setup_is_unsupported() {
        let err = ProcessBroker::new().request_setup().await.unwrap_err();
        assert!(matches!(err, SetupError::Unsupported(_)));
    }
}
