//! Per-operation method bookkeeping

use lynx_common::{DiscoveryMethod, DriverSummary, MethodFailure, OperationState};
use std::collections::BTreeSet;
use tracing::info;

/// Which methods ran, which were skipped, which failed.
#[derive(Debug, Default)]
pub struct ScanTally {
    attempted: Vec<DiscoveryMethod>,
    skipped: Vec<DiscoveryMethod>,
    failures: Vec<MethodFailure>,
    outstanding: BTreeSet<DiscoveryMethod>,
    summaries: Vec<DriverSummary>,
}

impl ScanTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&mut self, method: DiscoveryMethod) {
        self.attempted.push(method);
        self.outstanding.insert(method);
    }

    pub fn skip(&mut self, method: DiscoveryMethod) {
        self.skipped.push(method);
    }

    pub fn finished(&mut self, summary: DriverSummary) {
        self.outstanding.remove(&summary.method);
        self.summaries.push(summary);
    }

    /// Record a failure. A method fails at most once.
    pub fn failed(&mut self, method: DiscoveryMethod, reason: impl Into<String>) {
        self.outstanding.remove(&method);
        if self.failures.iter().all(|f| f.method != method) {
            self.failures.push(MethodFailure {
                method,
                reason: reason.into(),
            });
        }
    }

    /// Settle methods that produced neither a summary nor a failure.
    pub fn settle(&mut self, method: DiscoveryMethod) {
        self.outstanding.remove(&method);
    }

    /// Methods still running.
    pub fn outstanding(&self) -> Vec<DiscoveryMethod> {
        self.outstanding.iter().copied().collect()
    }

    pub fn attempted(&self) -> &[DiscoveryMethod] {
        &self.attempted
    }

    pub fn all_failed(&self) -> bool {
        !self.attempted.is_empty()
            && self
                .attempted
                .iter()
                .all(|m| self.failures.iter().any(|f| f.method == *m))
    }

    /// Final state given how the run ended.
    pub fn final_state(&self, cancelled_by_user: bool) -> OperationState {
        if cancelled_by_user {
            OperationState::Cancelled
        } else if self.all_failed() {
            OperationState::Failed
        } else {
            OperationState::Completed
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<DiscoveryMethod>,
        Vec<DiscoveryMethod>,
        Vec<MethodFailure>,
    ) {
        (self.attempted, self.skipped, self.failures)
    }

    pub fn log_summary(&self, operation_id: &str, hosts: usize) {
        info!(operation_id, "Scan Summary:");
        info!("  Methods attempted: {}", self.attempted.len());
        info!("  Methods skipped: {}", self.skipped.len());
        info!("  Methods failed: {}", self.failures.len());
        for s in &self.summaries {
            info!(
                "  {}: {} probed, {} found ({:?})",
                s.method, s.targets_probed, s.hosts_found, s.status
            );
        }
        info!("  Hosts found: {}", hosts);
    }
}
