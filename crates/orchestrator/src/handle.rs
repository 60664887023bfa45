//! Caller's side of a running operation

use crate::registry::OperationRegistry;
use anyhow::{Context, Result};
use lynx_common::{ProgressRecord, ScanSummary};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live result stream plus control over one operation.
///
/// The stream ends after the terminal `Completed` record. Dropping the
/// handle before the operation ends cancels it.
#[derive(Debug)]
pub struct ScanHandle {
    operation_id: String,
    records: mpsc::UnboundedReceiver<ProgressRecord>,
    registry: OperationRegistry,
    task: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    pub(crate) fn new(
        operation_id: String,
        records: mpsc::UnboundedReceiver<ProgressRecord>,
        registry: OperationRegistry,
        task: JoinHandle<ScanSummary>,
    ) -> Self {
        Self {
            operation_id,
            records,
            registry,
            task,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Next streamed record, `None` once the operation has finished.
    pub async fn next_record(&mut self) -> Option<ProgressRecord> {
        self.records.recv().await
    }

    pub fn records(&mut self) -> &mut mpsc::UnboundedReceiver<ProgressRecord> {
        &mut self.records
    }

    /// Cancel the operation. False if it already finished or was cancelled.
    pub fn cancel(&self) -> bool {
        self.registry.cancel(&self.operation_id)
    }

    /// Wait for the operation and return its summary. Records not yet read
    /// are discarded.
    pub async fn finish(mut self) -> Result<ScanSummary> {
        (&mut self.task)
            .await
            .with_context(|| format!("operation {} task failed", self.operation_id))
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        // while the task runs the ID cannot be re-registered, so it is still ours
        if !self.task.is_finished() {
            self.registry.cancel(&self.operation_id);
        }
    }
}
