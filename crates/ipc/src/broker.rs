//! Privilege as reported by a running daemon

use crate::client::IpcClient;
use async_trait::async_trait;
use lynx_common::{PrivilegeBroker, PrivilegeReport, PrivilegeState, SetupError};
use std::path::PathBuf;
use std::time::Duration;

const CHECK_CEILING: Duration = Duration::from_secs(5);

/// Asks the daemon whether it holds raw sockets. Setup is delegated to the
/// platform broker that installs the daemon.
pub struct DaemonBroker {
    socket: PathBuf,
    setup: Box<dyn PrivilegeBroker>,
}

impl DaemonBroker {
    pub fn new(socket: impl Into<PathBuf>, setup: impl PrivilegeBroker + 'static) -> Self {
        Self {
            socket: socket.into(),
            setup: Box::new(setup),
        }
    }
}

#[async_trait]
impl PrivilegeBroker for DaemonBroker {
    async fn check_privilege(&self) -> PrivilegeReport {
        let client = match IpcClient::connect(&self.socket).await {
            Ok(client) => client.with_ceiling(CHECK_CEILING),
            Err(e) => {
                return PrivilegeReport::new(PrivilegeState::NotFound).with_reason(e.to_string())
            }
        };
        match client.check_privileges().await {
            Ok(check) if check.is_privileged => PrivilegeReport::granted(),
            Ok(check) => PrivilegeReport::new(PrivilegeState::NotRegistered).with_reason(
                check
                    .reason
                    .unwrap_or_else(|| "daemon lacks raw-socket access".to_string()),
            ),
            Err(e) => PrivilegeReport::new(PrivilegeState::NotRegistered).with_reason(e.to_string()),
        }
    }

    async fn request_setup(&self) -> Result<(), SetupError> {
        self.setup.request_setup().await
    }

    fn name(&self) -> &str {
        "daemon"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::auth::PeerCredentials;
    use crate::server::IpcServer;
    use crate::test_support::{sh_worker, socket_path};
    use lynx_privilege::StaticBroker;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn missing_daemon_is_not_found() {
        let broker = DaemonBroker::new(
            "/nonexistent/lynx.sock",
            StaticBroker::new(PrivilegeState::NotRegistered),
        );
        assert_eq!(broker.check_privilege().await.state, PrivilegeState::NotFound);
        assert!(matches!(
            broker.request_setup().await,
            Err(SetupError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn daemon_answer_is_reported() {
        let path = socket_path();
        let server = IpcServer::bind(&path, sh_worker("exit 0"))
            .unwrap()
            .with_verifier(|_: &PeerCredentials| true)
            .with_broker(StaticBroker::new(PrivilegeState::Granted));
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let broker =
            DaemonBroker::new(&path, StaticBroker::new(PrivilegeState::NotRegistered));
        assert_eq!(broker.check_privilege().await.state, PrivilegeState::Granted);
        shutdown.cancel();
    }
}
