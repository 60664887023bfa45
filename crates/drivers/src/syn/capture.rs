//! `AF_PACKET` capture thread and the pending-probe table it completes.

use super::socket::RawSender;
use super::{classify, Answer};
use crate::packet::{
    build_ipv4_syn, parse_tcp_segment, TcpSegment, ETHERNET_HEADER_LEN, SYN_PACKET_LEN,
};
use dashmap::DashMap;
use lynx_common::{DriverError, DriverResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{ErrorKind, Read};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

const READ_SLICE: Duration = Duration::from_millis(50);

/// (target, target port, our source port)
pub type ProbeKey = (Ipv4Addr, u16, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub answer: Answer,
    pub rtt: Duration,
}

/// Probes waiting for an answer. One table per driver run.
#[derive(Debug, Clone, Default)]
pub struct PendingProbes {
    inner: Arc<DashMap<ProbeKey, (Instant, oneshot::Sender<Reply>)>>,
}

impl PendingProbes {
    pub fn register(&self, key: ProbeKey) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(key, (Instant::now(), tx));
        rx
    }

    pub fn forget(&self, key: &ProbeKey) {
        self.inner.remove(key);
    }

    /// Hand an inbound segment to the probe it answers. False if it answers none.
    pub fn complete(&self, segment: &TcpSegment) -> bool {
        let Some(answer) = classify(segment) else {
            return false;
        };
        let key = (segment.src, segment.src_port, segment.dst_port);
        match self.inner.remove(&key) {
            Some((_, (sent_at, tx))) => tx
                .send(Reply {
                    answer,
                    rtt: sent_at.elapsed(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Running capture thread. Dropping it stops the thread within one read slice.
pub struct Capture {
    stop: Arc<AtomicBool>,
}

impl Capture {
    pub fn start(pending: PendingProbes) -> DriverResult<Self> {
        let protocol = Protocol::from(i32::from((libc::ETH_P_IP as u16).to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .map_err(|e| DriverError::from_socket_error("packet capture socket", e))?;
        socket.set_read_timeout(Some(READ_SLICE))?;
        let _ = socket.set_recv_buffer_size(8 * 1024 * 1024);

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        std::thread::Builder::new()
            .name("syn-capture".to_string())
            .spawn(move || run(socket, &pending, &flag))?;

        Ok(Self { stop })
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn run(socket: Socket, pending: &PendingProbes, stop: &AtomicBool) {
    let mut buf = vec![0u8; 65536];
    let mut matched = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let len = match (&socket).read(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                debug!(error = %e, "capture read failed");
                continue;
            }
        };
        let Some(datagram) = buf.get(ETHERNET_HEADER_LEN..len) else {
            continue;
        };
        if let Some(segment) = parse_tcp_segment(datagram) {
            if pending.complete(&segment) {
                matched += 1;
            }
        }
    }

    debug!(matched, "capture stopped");
}

/// Send one SYN per attempt and wait for its answer. `None` when every
/// attempt went unanswered.
pub async fn probe_port(
    sender: &RawSender,
    pending: &PendingProbes,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    port: u16,
    wait: Duration,
    retries: u32,
) -> Option<Reply> {
    let mut packet = [0u8; SYN_PACKET_LEN];

    for _ in 0..=retries {
        let src_port = 32768 + rand::random::<u16>() % 28232;
        let key = (dst, port, src_port);
        let rx = pending.register(key);

        let len = build_ipv4_syn(&mut packet, src, dst, src_port, port, rand::random());
        if let Err(e) = sender.send(&packet[..len], dst) {
            debug!(%dst, port, error = %e, "SYN send failed");
            pending.forget(&key);
            continue;
        }

        match timeout(wait, rx).await {
            Ok(Ok(reply)) => return Some(reply),
            _ => pending.forget(&key),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tcp_flags;

    fn answer(flags: u8, src_port: u16, dst_port: u16) -> TcpSegment {
        TcpSegment {
            src: Ipv4Addr::new(192, 168, 1, 20),
            dst: Ipv4Addr::new(192, 168, 1, 2),
            src_port,
            dst_port,
            flags,
        }
    }

    #[tokio::test]
    async fn syn_ack_completes_matching_probe() {
        let pending = PendingProbes::default();
        let rx = pending.register((Ipv4Addr::new(192, 168, 1, 20), 443, 40001));

        assert!(pending.complete(&answer(tcp_flags::SYN | tcp_flags::ACK, 443, 40001)));
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.await.unwrap().answer, Answer::Open);
    }

    #[tokio::test]
    async fn rst_completes_as_closed() {
        let pending = PendingProbes::default();
        let rx = pending.register((Ipv4Addr::new(192, 168, 1, 20), 22, 40002));

        assert!(pending.complete(&answer(tcp_flags::RST | tcp_flags::ACK, 22, 40002)));
        assert_eq!(rx.await.unwrap().answer, Answer::Closed);
    }

    #[test]
    fn unrelated_segments_are_ignored() {
        let pending = PendingProbes::default();
        let _rx = pending.register((Ipv4Addr::new(192, 168, 1, 20), 80, 40003));

        // wrong source port
        assert!(!pending.complete(&answer(tcp_flags::SYN | tcp_flags::ACK, 80, 40004)));
        // our own outgoing SYN
        assert!(!pending.complete(&answer(tcp_flags::SYN, 80, 40003)));
        assert_eq!(pending.len(), 1);

        pending.forget(&(Ipv4Addr::new(192, 168, 1, 20), 80, 40003));
        assert_eq!(pending.len(), 0);
    }
}
