//! UDP service probe
//!
//! Sends protocol-shaped datagrams to well-known UDP ports over a connected
//! socket. Any reply is evidence, and so is an ICMP port-unreachable, which a
//! connected socket surfaces as `ConnectionRefused`.

use crate::ProbeContext;
use lynx_common::{DriverResult, DriverSummary, HostRecord};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

pub const UDP_PORTS: &[u16] = &[53, 67, 68, 123, 137, 138, 161, 500, 1900, 5353];

const MAX_WAIT: Duration = Duration::from_millis(200);

/// Standard query for `version.bind` TXT/CH, enough to make resolvers answer.
const DNS_QUERY: &[u8] = &[
    0x4c, 0x59, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'v', b'e',
    b'r', b's', b'i', b'o', b'n', 0x04, b'b', b'i', b'n', b'd', 0x00, 0x00, 0x10, 0x00, 0x03,
];

/// NetBIOS node status request for the wildcard name `*`.
const NBNS_QUERY: &[u8] = &[
    0x80, 0xf0, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x43, 0x4b,
    0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41,
    0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41,
    0x00, 0x00, 0x21, 0x00, 0x01,
];

/// SNMPv1 GetRequest for sysDescr.0 with community `public`.
const SNMP_GET: &[u8] = &[
    0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x19,
    0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
    0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
];

const SSDP_SEARCH: &[u8] = b"M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 1\r\nST: ssdp:all\r\n\r\n";

/// PTR query for `_services._dns-sd._udp.local` with the unicast-response bit.
const MDNS_QUERY: &[u8] = &[
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, b'_', b's',
    b'e', b'r', b'v', b'i', b'c', b'e', b's', 0x07, b'_', b'd', b'n', b's', b'-', b's', b'd',
    0x04, b'_', b'u', b'd', b'p', 0x05, b'l', b'o', b'c', b'a', b'l', 0x00, 0x00, 0x0c, 0x80,
    0x01,
];

/// Payload for a port; a single zero byte when no protocol applies.
pub fn payload_for(port: u16) -> Vec<u8> {
    match port {
        53 => DNS_QUERY.to_vec(),
        123 => {
            // NTPv3 client request
            let mut ntp = vec![0u8; 48];
            ntp[0] = 0x1b;
            ntp
        }
        137 => NBNS_QUERY.to_vec(),
        161 => SNMP_GET.to_vec(),
        1900 => SSDP_SEARCH.to_vec(),
        5353 => MDNS_QUERY.to_vec(),
        _ => vec![0x00],
    }
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    let wait = MAX_WAIT.min(ctx.options.timeout());
    let semaphore = Arc::new(Semaphore::new(ctx.options.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    let mut probed = 0usize;
    for ip in ctx.target.addresses() {
        probed += 1;
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let sink = ctx.sink.clone();
        let cancel = ctx.cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            for &port in UDP_PORTS {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(rtt) = probe_port(SocketAddr::new(ip, port), wait).await {
                    debug!(%ip, port, "udp evidence");
                    sink.host(HostRecord::new(ip).with_latency(rtt));
                    return;
                }
            }
        });
        while tasks.try_join_next().is_some() {}
    }

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
            next = tasks.join_next() => if next.is_none() { break },
        }
    }

    Ok(ctx.summary(probed))
}

/// One probe on one port. Returns the RTT when the host showed any sign of life.
async fn probe_port(addr: SocketAddr, wait: Duration) -> Option<Duration> {
    let bind: SocketAddr = match addr.ip() {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(addr).await.ok()?;

    let start = Instant::now();
    match socket.send(&payload_for(addr.port())).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => return Some(start.elapsed()),
        Err(_) => return None,
    }

    let mut buf = [0u8; 1500];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => Some(start.elapsed()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, drain_hosts};
    use lynx_common::{DiscoveryMethod, ScanOptions, TargetSpecification};

    #[test]
    fn payloads_are_protocol_shaped() {
        assert_eq!(payload_for(123).len(), 48);
        assert_eq!(payload_for(123)[0], 0x1b);
        assert!(payload_for(1900).starts_with(b"M-SEARCH"));
        assert_eq!(&payload_for(161)[7..13], b"public");
        assert_eq!(payload_for(9999), vec![0x00]);
    }

    #[tokio::test]
    async fn reply_counts_as_evidence() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, peer)) = responder.recv_from(&mut buf).await {
                let _ = responder.send_to(b"hi", peer).await;
            }
        });

        assert!(probe_port(addr, Duration::from_millis(500)).await.is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn loopback_host_is_found() {
        // Closed loopback ports answer with port-unreachable.
        let spec = TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()]);
        let (ctx, mut rx) = context(DiscoveryMethod::UdpProbe, spec, ScanOptions::default());
        let summary = probe(&ctx).await.unwrap();

        assert_eq!(summary.hosts_found, 1);
        assert_eq!(drain_hosts(&mut rx).len(), 1);
    }
}
