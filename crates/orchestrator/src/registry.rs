//! Live operations, by operation ID

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lynx_common::OperationState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Operation {
    state: OperationState,
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// Maps operation ID to lifecycle state and cancellation token.
///
/// An entry lives from [`register`](Self::register) until
/// [`finish`](Self::finish); it is removed exactly once.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Arc<DashMap<String, Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `Pending` operation. False if the ID is already live.
    pub fn register(&self, operation_id: &str, cancel: CancellationToken) -> bool {
        match self.operations.entry(operation_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Operation {
                    state: OperationState::Pending,
                    cancel,
                    cancel_requested: false,
                });
                true
            }
        }
    }

    pub fn set_state(&self, operation_id: &str, state: OperationState) {
        if let Some(mut op) = self.operations.get_mut(operation_id) {
            op.state = state;
        }
    }

    pub fn state(&self, operation_id: &str) -> Option<OperationState> {
        self.operations.get(operation_id).map(|op| op.state)
    }

    /// Trigger the operation's token. False for unknown or finished
    /// operations, and for a repeated cancel.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let Some(mut op) = self.operations.get_mut(operation_id) else {
            return false;
        };
        if op.state.is_terminal() || op.cancel_requested {
            return false;
        }
        op.cancel_requested = true;
        op.cancel.cancel();
        debug!(operation_id, "cancel requested");
        true
    }

    /// Whether a cancel was requested for a live operation.
    pub fn cancel_requested(&self, operation_id: &str) -> bool {
        self.operations
            .get(operation_id)
            .map(|op| op.cancel_requested)
            .unwrap_or(false)
    }

    /// Remove the entry. Returns the final state on the first call, `None`
    /// after that.
    pub fn finish(&self, operation_id: &str, state: OperationState) -> Option<OperationState> {
        self.operations.remove(operation_id).map(|_| state)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
