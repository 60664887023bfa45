//! ICMP echo sweep over a raw socket
//!
//! Needs CAP_NET_RAW (or root). Runs on a blocking thread; the receive loop
//! wakes every 50 ms to check for cancellation.

use crate::packet::{build_echo_request, parse_echo_reply};
use crate::pacing::send_interval;
use crate::{join_error, ProbeContext};
use lynx_common::{DriverError, DriverResult, DriverSummary, HostRecord, MAX_RETRIES};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::debug;

const READ_SLICE: Duration = Duration::from_millis(50);
const MIN_WINDOW: Duration = Duration::from_millis(100);

/// Listen time per attempt: the base timeout split across attempts, floored.
pub fn attempt_window(timeout: Duration, attempts: u32) -> Duration {
    (timeout / attempts.max(1)).max(MIN_WINDOW)
}

fn open_socket() -> DriverResult<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| DriverError::from_socket_error("raw ICMP socket", e))?;
    socket.set_read_timeout(Some(READ_SLICE))?;
    Ok(socket)
}

/// Echo attempts per target for a `retries` option.
pub fn attempts(retries: u32) -> u32 {
    retries.min(MAX_RETRIES).saturating_add(1)
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    if !ctx.target.has_ipv4() {
        ctx.sink.info("no IPv4 targets for ICMP");
        return Ok(ctx.summary(0));
    }

    let socket = open_socket()?;
    let worker_ctx = ctx.clone();
    let count = tokio::task::spawn_blocking(move || sweep(&worker_ctx, socket))
        .await
        .map_err(join_error)??;

    Ok(ctx.summary(count))
}

/// Returns the number of distinct targets sent to.
fn sweep(ctx: &ProbeContext, socket: Socket) -> DriverResult<usize> {
    let identifier: u16 = rand::random();
    let attempts = attempts(ctx.options.retries);
    let window = attempt_window(ctx.options.timeout(), attempts);
    let gap = send_interval(ctx.options.rate_limit);

    let mut sent: HashMap<(Ipv4Addr, u16), Instant> = HashMap::new();
    let mut answered: HashSet<Ipv4Addr> = HashSet::new();
    let mut buf = [0u8; 1500];
    let mut probed = 0usize;

    for attempt in 0..attempts {
        let sequence = attempt as u16;
        let mut pending = 0usize;

        for target in ctx.target.ipv4_addresses() {
            if ctx.cancel.is_cancelled() {
                return Ok(probed);
            }
            if attempt == 0 {
                probed += 1;
            }
            if answered.contains(&target) {
                continue;
            }
            pending += 1;
            let packet = build_echo_request(identifier, sequence);
            let dest = SockAddr::from(SocketAddrV4::new(target, 0));
            match socket.send_to(&packet, &dest) {
                Ok(_) => {
                    sent.insert((target, sequence), Instant::now());
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    return Err(DriverError::from_socket_error("ICMP send", e));
                }
                Err(e) => debug!(%target, error = %e, "echo send failed"),
            }
            if let Some(gap) = gap {
                std::thread::sleep(gap);
            }
        }

        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if ctx.cancel.is_cancelled() {
                return Ok(probed);
            }
            let len = match (&socket).read(&mut buf) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) => {
                    debug!(error = %e, "ICMP receive failed");
                    continue;
                }
            };

            let Some(reply) = parse_echo_reply(&buf[..len]) else {
                continue;
            };
            if reply.identifier != identifier || answered.contains(&reply.source) {
                continue;
            }
            let Some(sent_at) = sent.get(&(reply.source, reply.sequence)) else {
                continue;
            };

            answered.insert(reply.source);
            ctx.sink
                .host(HostRecord::new(IpAddr::V4(reply.source)).with_latency(sent_at.elapsed()));
        }

        if pending == 0 || answered.len() >= probed {
            break;
        }
    }

    Ok(probed)
}
