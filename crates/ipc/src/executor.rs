//! Privileged execution through the daemon

use crate::client::{IpcClient, DEFAULT_CEILING};
use async_trait::async_trait;
use lynx_common::{Completion, PrivilegedExecutor, RecordSink, ScanMode, ScanRequest};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Sends each request to `lynx-daemon` on its own connection, so a dropped
/// executor future also ends the remote operation.
#[derive(Debug, Clone)]
pub struct IpcExecutor {
    socket: PathBuf,
    ceiling: Duration,
}

impl IpcExecutor {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            ceiling: DEFAULT_CEILING,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }
}

#[async_trait]
impl PrivilegedExecutor for IpcExecutor {
    #[instrument(skip(self, request, records, cancel), fields(operation_id = %request.operation_id))]
    async fn execute(
        &self,
        request: ScanRequest,
        records: RecordSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<Completion> {
        let client = IpcClient::connect(&self.socket)
            .await?
            .with_ceiling(self.ceiling);
        let operation_id = request.operation_id.clone();
        let mut operation = match request.options.mode {
            ScanMode::Discover => client.discover(request).await?,
            ScanMode::Scan => client.scan(request).await?,
        };

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    let cancelled = client.cancel(&operation_id).await?;
                    debug!(cancelled, "remote cancel");
                }
                record = operation.next_record() => match record? {
                    Some(record) => {
                        let _ = records.send(record);
                    }
                    None => break,
                },
            }
        }

        Ok(operation.completion().await?)
    }

    fn name(&self) -> &str {
        "ipc"
    }
}
