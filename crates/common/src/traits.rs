//! Core traits for Lynx components
//!
//! The two seams that vary per platform and per deployment: who grants raw
//! socket access, and where privileged drivers actually run.

use crate::error::SetupError;
use crate::types::{Completion, PrivilegeReport, ProgressRecord, ScanRequest};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel a privileged executor streams records into.
pub type RecordSink = mpsc::UnboundedSender<ProgressRecord>;

/// Platform mechanism that grants the helper raw-socket access
#[async_trait]
pub trait PrivilegeBroker: Send + Sync {
    /// Current registration state. Never fails; problems surface as a state plus reason.
    async fn check_privilege(&self) -> PrivilegeReport;

    /// Ask the OS (and usually the user) to grant privilege.
    async fn request_setup(&self) -> Result<(), SetupError>;

    /// Broker name/identifier
    fn name(&self) -> &str;
}

/// Somewhere privileged drivers can run: a worker subprocess or the daemon
#[async_trait]
pub trait PrivilegedExecutor: Send + Sync {
    /// Run `request` to completion, streaming host and log records into `records`.
    ///
    /// Must return promptly once `cancel` fires. The returned completion is
    /// delivered after the last record.
    async fn execute(
        &self,
        request: ScanRequest,
        records: RecordSink,
        cancel: CancellationToken,
    ) -> Result<Completion>;

    /// Executor name/identifier
    fn name(&self) -> &str;
}
