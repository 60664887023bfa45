//! TCP connect discovery
//!
//! Full three-way handshakes through the OS stack; no privilege needed. Only
//! an accepted connection counts as evidence of a live host.

use crate::pacing::RateLimiter;
use crate::ProbeContext;
use lynx_common::{DriverResult, DriverSummary, HostRecord, ScanMode, MAX_RETRIES};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Ports tried when the target specification names none.
pub const DEFAULT_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 515, 548, 554, 631, 993, 995, 1433,
    1883, 3306, 3389, 5000, 5001, 5353, 5900, 6379, 8000, 8008, 8080, 8081, 8443, 8888, 9000,
    9100, 49152, 62078,
];

/// Ceiling on the first connect attempt; closed ports answer quickly.
const INITIAL_ATTEMPT: Duration = Duration::from_millis(400);

#[instrument(skip(ctx), fields(targets = ctx.target.blocks.len()))]
pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    let ports = ctx.target.ports_or(DEFAULT_PORTS);
    let connect_timeout = ctx.options.timeout();
    let retries = ctx.options.retries.min(MAX_RETRIES);
    let discover = ctx.options.mode == ScanMode::Discover;

    let semaphore = Arc::new(Semaphore::new(ctx.options.concurrency.max(1)));
    let limiter = RateLimiter::from_option(ctx.options.rate_limit).map(Arc::new);
    let mut tasks = JoinSet::new();

    // Port-major order: every host sees its first port before any host sees its second.
    let mut probed = 0usize;
    'outer: for (round, port) in ports.iter().enumerate() {
        for ip in ctx.target.addresses() {
            if ctx.cancel.is_cancelled() {
                break 'outer;
            }
            if round == 0 {
                probed += 1;
            }
            if discover && ctx.sink.has_found(&ip) {
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

            let sink = ctx.sink.clone();
            let cancel = ctx.cancel.clone();
            let addr = SocketAddr::new(ip, *port);
            tasks.spawn(async move {
                let _permit = permit;
                if discover && sink.has_found(&addr.ip()) {
                    return;
                }
                let start = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    r = try_connect(addr, connect_timeout, retries) => r,
                };
                if let Ok((_stream, rtt)) = outcome {
                    debug!(%addr, rtt_ms = rtt.as_millis() as u64, "port open");
                    sink.host(
                        HostRecord::new(addr.ip())
                            .with_port(addr.port())
                            .with_latency(rtt),
                    );
                } else {
                    debug!(%addr, elapsed_ms = start.elapsed().as_millis() as u64, "no answer");
                }
            });

            // Reap finished probes so the set stays small on large spaces.
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

    Ok(ctx.summary(probed))
}

/// Connect with a short first attempt, then full-timeout retries with linear
/// backoff. A refusal ends the attempts at once. Returns the stream and the
/// RTT of the successful attempt.
async fn try_connect(
    addr: SocketAddr,
    connect_timeout: Duration,
    retries: u32,
) -> std::io::Result<(TcpStream, Duration)> {
    let initial_timeout = INITIAL_ATTEMPT.min(connect_timeout);
    let mut last_error = std::io::Error::new(ErrorKind::TimedOut, "connection timeout");

    for attempt in 0..=retries.max(1) {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt - 1))).await;
        }

        let attempt_timeout = if attempt == 0 {
            initial_timeout
        } else {
            connect_timeout
        };
        let start = Instant::now();
        match timeout(attempt_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok((stream, start.elapsed())),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => return Err(e),
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = std::io::Error::new(ErrorKind::TimedOut, "connection timeout")
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, drain_hosts};
    use lynx_common::{DiscoveryMethod, DriverStatus, PortRange, ScanOptions, TargetSpecification};
    use tokio::net::TcpListener;

    fn loopback_spec(port: u16) -> TargetSpecification {
        TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()])
            .with_ports(vec![PortRange::single(port)])
    }

    #[tokio::test]
    async fn finds_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let options = ScanOptions::default().with_timeout(Duration::from_millis(500));
        let (ctx, mut rx) = context(DiscoveryMethod::TcpConnect, loopback_spec(port), options);
        let summary = probe(&ctx).await.unwrap();

        assert_eq!(summary.status, DriverStatus::Completed);
        assert_eq!(summary.hosts_found, 1);
        let hosts = drain_hosts(&mut rx);
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].open_ports.contains(&port));
        assert!(hosts[0].methods.contains(&DiscoveryMethod::TcpConnect));
        assert!(hosts[0].latency_us.is_some());
    }

    #[tokio::test]
    async fn closed_port_is_not_evidence() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let options = ScanOptions::default().with_timeout(Duration::from_millis(300));
        let (ctx, mut rx) = context(DiscoveryMethod::TcpConnect, loopback_spec(port), options);
        let summary = probe(&ctx).await.unwrap();

        assert_eq!(summary.hosts_found, 0);
        assert!(drain_hosts(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn scan_mode_reports_every_open_port() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = [a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];
        for l in [a, b] {
            tokio::spawn(async move {
                loop {
                    let _ = l.accept().await;
                }
            });
        }

        let spec = TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()]).with_ports(
            ports.iter().map(|p| PortRange::single(*p)).collect(),
        );
        let options = ScanOptions::default()
            .with_timeout(Duration::from_millis(500))
            .with_mode(ScanMode::Scan);
        let (ctx, mut rx) = context(DiscoveryMethod::TcpConnect, spec, options);
        probe(&ctx).await.unwrap();

        let mut seen: Vec<u16> = drain_hosts(&mut rx)
            .into_iter()
            .flat_map(|h| h.open_ports)
            .collect();
        seen.sort_unstable();
        let mut expected = ports.to_vec();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn cancelled_run_emits_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (ctx, mut rx) = context(
            DiscoveryMethod::TcpConnect,
            loopback_spec(port),
            ScanOptions::default(),
        );
        ctx.cancel.cancel();

        let summary = probe(&ctx).await.unwrap();
        assert_eq!(summary.status, DriverStatus::Cancelled);
        assert!(drain_hosts(&mut rx).is_empty());
        drop(listener);
    }

    #[tokio::test]
    async fn cancel_on_a_huge_block_returns_promptly() {
        let spec = TargetSpecification::new(vec!["127.0.0.0/8".parse().unwrap()])
            .with_ports(vec![PortRange::single(9)]);
        let options = ScanOptions::default().with_timeout(Duration::from_millis(200));
        let (ctx, _rx) = context(DiscoveryMethod::TcpConnect, spec, options);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(2), probe(&ctx))
            .await
            .expect("probe outlived the grace period")
            .unwrap();
        assert_eq!(summary.status, DriverStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(summary.targets_probed < 1 << 24);
    }
}
