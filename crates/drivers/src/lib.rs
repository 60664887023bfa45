//! Lynx Drivers - the nine discovery techniques
//!
//! Every driver follows the same contract: probe the target space described
//! by a [`ProbeContext`], emit host records incrementally through its
//! [`EventSink`], stop promptly when the cancellation token fires, and
//! return a [`DriverSummary`]. Per-target failures are swallowed; only a
//! total failure (no socket, no interface, wrong platform) becomes a
//! [`DriverError`].
//!
//! Drivers do not know whether they run in the orchestrator, in the worker
//! subprocess, or behind the privileged daemon.

pub mod arp_cache;
pub mod arp_scan;
pub mod icmp;
mod listen;
pub mod mdns;
pub mod packet;
pub mod pacing;
pub mod sink;
pub mod ssdp;
pub mod syn;
pub mod tcp_connect;
pub mod udp_probe;
pub mod ws_discovery;

pub use sink::{DriverEvent, EventSink};

use lynx_common::{
    DiscoveryMethod, DriverError, DriverResult, DriverSummary, ScanOptions, TargetSpecification,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a driver needs for one run.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub target: Arc<TargetSpecification>,
    pub options: Arc<ScanOptions>,
    pub sink: EventSink,
    pub cancel: CancellationToken,
}

impl ProbeContext {
    pub fn new(
        target: Arc<TargetSpecification>,
        options: Arc<ScanOptions>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            options,
            sink,
            cancel,
        }
    }

    /// Summary for this run, `Cancelled` if the token fired.
    pub fn summary(&self, targets_probed: usize) -> DriverSummary {
        DriverSummary::new(self.sink.method(), self.cancel.is_cancelled())
            .with_counts(targets_probed, self.sink.hosts_found())
    }

    /// Sleep that ends early on cancellation. Returns false if cancelled.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Run one driver to completion.
pub async fn probe(method: DiscoveryMethod, mut ctx: ProbeContext) -> DriverResult<DriverSummary> {
    if ctx.sink.method() != method {
        ctx.sink = ctx.sink.for_method(method);
    }
    debug!(method = %method, "driver starting");

    match method {
        DiscoveryMethod::TcpConnect => tcp_connect::probe(&ctx).await,
        DiscoveryMethod::Mdns => mdns::probe(&ctx).await,
        DiscoveryMethod::Ssdp => ssdp::probe(&ctx).await,
        DiscoveryMethod::WsDiscovery => ws_discovery::probe(&ctx).await,
        DiscoveryMethod::ArpCache => arp_cache::probe(&ctx).await,
        DiscoveryMethod::UdpProbe => udp_probe::probe(&ctx).await,
        DiscoveryMethod::IcmpEcho => icmp::probe(&ctx).await,
        DiscoveryMethod::ArpScan => arp_scan::probe(&ctx).await,
        DiscoveryMethod::TcpSyn => syn::probe(&ctx).await,
    }
}

/// Whether the driver has an implementation on this platform at all.
pub const fn is_supported(method: DiscoveryMethod) -> bool {
    match method {
        DiscoveryMethod::TcpSyn => cfg!(target_os = "linux"),
        _ => true,
    }
}

/// Map a `spawn_blocking` join failure onto the driver error type.
pub(crate) fn join_error(err: tokio::task::JoinError) -> DriverError {
    DriverError::Failed(format!("capture task failed: {err}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use lynx_common::DriverStatus;

    #[tokio::test]
    async fn cancelled_context_reports_cancelled() {
        let (ctx, _rx) = test_support::context(
            DiscoveryMethod::Ssdp,
            TargetSpecification::default(),
            ScanOptions::default(),
        );
        ctx.cancel.cancel();
        assert!(!ctx.pause(Duration::from_secs(5)).await);
        assert_eq!(ctx.summary(0).status, DriverStatus::Cancelled);
    }

    #[test]
    fn syn_support_is_platform_gated() {
        assert!(is_supported(DiscoveryMethod::IcmpEcho));
        assert_eq!(
            is_supported(DiscoveryMethod::TcpSyn),
            cfg!(target_os = "linux")
        );
    }
}
