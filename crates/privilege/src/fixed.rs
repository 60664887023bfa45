//! Fixed-answer broker for platforms without a setup workflow

use crate::process::raw_socket_report;
use async_trait::async_trait;
use lynx_common::{PrivilegeBroker, PrivilegeReport, PrivilegeState, SetupError};

#[derive(Debug, Clone)]
pub struct StaticBroker {
    report: PrivilegeReport,
}

impl StaticBroker {
    pub fn new(state: PrivilegeState) -> Self {
        Self {
            report: PrivilegeReport::new(state),
        }
    }

    /// `Granted` when this process already holds raw sockets, else `NotRegistered`.
    pub fn detect() -> Self {
        Self {
            report: raw_socket_report(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.report = self.report.with_reason(reason);
        self
    }
}

#[async_trait]
impl PrivilegeBroker for StaticBroker {
    async fn check_privilege(&self) -> PrivilegeReport {
        self.report.clone()
    }

    async fn request_setup(&self) -> Result<(), SetupError> {
        Err(SetupError::Unsupported(
            "privilege setup is not available on this platform".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "static"
    }
}
