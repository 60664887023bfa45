//! TCP SYN (half-open) probing
//!
//! Crafted SYNs go out through a raw IPv4 socket; answers are read off an
//! `AF_PACKET` capture thread and matched back to the waiting probe by
//! `(target, target port, source port)`. A SYN-ACK proves an open port, a
//! RST proves a live host. Linux only.

#[cfg(target_os = "linux")]
mod capture;
#[cfg(target_os = "linux")]
mod socket;

use crate::packet::TcpSegment;
use crate::ProbeContext;
use lynx_common::{DriverResult, DriverSummary};

/// Ports tried when the target specification names none.
pub const DEFAULT_PORTS: &[u16] = &[80, 443, 22, 445, 139];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// SYN-ACK
    Open,
    /// RST: nothing listening, but the host is up
    Closed,
}

/// Classify an inbound segment. Anything but SYN-ACK or RST is not an answer.
#[inline]
pub fn classify(segment: &TcpSegment) -> Option<Answer> {
    if segment.is_syn_ack() {
        Some(Answer::Open)
    } else if segment.is_rst() {
        Some(Answer::Closed)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn probe(_ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    Err(lynx_common::DriverError::Unsupported(
        "TCP SYN probing is only implemented on Linux".to_string(),
    ))
}

#[cfg(target_os = "linux")]
pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    use crate::pacing::RateLimiter;
    use capture::{Capture, PendingProbes};
    use lynx_common::{HostRecord, ScanMode, MAX_RETRIES};
    use socket::{source_for, RawSender};
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio::task::JoinSet;
    use tracing::debug;

    if !ctx.target.has_ipv4() {
        ctx.sink.info("no IPv4 targets for TCP SYN");
        return Ok(ctx.summary(0));
    }

    let sender = Arc::new(RawSender::open()?);
    let pending = PendingProbes::default();
    let _capture = Capture::start(pending.clone())?;

    // Route lookups happen once per target, as the first port reaches it.
    let mut sources: HashMap<Ipv4Addr, Option<Ipv4Addr>> = HashMap::new();

    let ports = ctx.target.ports_or(DEFAULT_PORTS);
    let wait = ctx.options.timeout();
    let retries = ctx.options.retries.min(MAX_RETRIES);
    let discover = ctx.options.mode == ScanMode::Discover;
    let semaphore = Arc::new(Semaphore::new(ctx.options.concurrency.max(1)));
    let limiter = RateLimiter::from_option(ctx.options.rate_limit).map(Arc::new);
    let mut tasks = JoinSet::new();

    'outer: for port in &ports {
        for dst in ctx.target.ipv4_addresses() {
            if ctx.cancel.is_cancelled() {
                break 'outer;
            }
            let route = *sources.entry(dst).or_insert_with(|| match source_for(dst) {
                Ok(src) => Some(src),
                Err(e) => {
                    debug!(%dst, error = %e, "no route");
                    None
                }
            });
            let Some(src) = route else {
                continue;
            };
            if discover && ctx.sink.has_found(&IpAddr::V4(dst)) {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break 'outer,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break 'outer,
                },
            };
            if let Some(limiter) = &limiter {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break 'outer,
                    _ = limiter.acquire() => {}
                }
            }

            let sender = sender.clone();
            let pending = pending.clone();
            let sink = ctx.sink.clone();
            let cancel = ctx.cancel.clone();
            let port = *port;
            tasks.spawn(async move {
                let _permit = permit;
                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    r = capture::probe_port(&sender, &pending, src, dst, port, wait, retries) => r,
                };
                let Some(reply) = reply else { return };

                let mut record = HostRecord::new(IpAddr::V4(dst)).with_latency(reply.rtt);
                if reply.answer == Answer::Open {
                    debug!(%dst, port, "SYN-ACK");
                    record = record.with_port(port);
                }
                sink.host(record);
            });

            while tasks.try_join_next().is_some() {}
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
            next = tasks.join_next() => {
                if next.is_none() {
                    break;
                }
            }
        }
    }

    Ok(ctx.summary(sources.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tcp_flags;
    use std::net::Ipv4Addr;

    fn segment(flags: u8) -> TcpSegment {
        TcpSegment {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 80,
            dst_port: 40000,
            flags,
        }
    }

    #[test]
    fn classify_answers() {
        assert_eq!(
            classify(&segment(tcp_flags::SYN | tcp_flags::ACK)),
            Some(Answer::Open)
        );
        assert_eq!(
            classify(&segment(tcp_flags::RST | tcp_flags::ACK)),
            Some(Answer::Closed)
        );
        assert_eq!(classify(&segment(tcp_flags::ACK)), None);
        assert_eq!(classify(&segment(tcp_flags::SYN)), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn loopback_probe_or_permission_denied() {
        use crate::test_support::context;
        use lynx_common::{
            DiscoveryMethod, DriverError, PortRange, ScanOptions, TargetSpecification,
        };
        use std::time::Duration;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()])
            .with_ports(vec![PortRange::single(port)]);
        let options = ScanOptions::default()
            .with_timeout(Duration::from_millis(500))
            .with_retries(0);
        let (ctx, _rx) = context(DiscoveryMethod::TcpSyn, spec, options);

        match probe(&ctx).await {
            Ok(summary) => assert!(summary.hosts_found <= 1),
            Err(DriverError::PermissionDenied(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
