//! Receive loop shared by the multicast drivers

use crate::ProbeContext;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::debug;

pub(crate) const RECV_SLICE: Duration = Duration::from_millis(100);

/// Feed every datagram that arrives within `window` to `on_datagram`, in
/// receive slices of at most [`RECV_SLICE`]. Returns early on cancellation.
pub(crate) async fn collect<F>(
    ctx: &ProbeContext,
    socket: &UdpSocket,
    window: Duration,
    max_len: usize,
    mut on_datagram: F,
) where
    F: FnMut(&[u8], SocketAddr),
{
    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; max_len];

    while !ctx.cancel.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            r = timeout(RECV_SLICE.min(remaining), socket.recv_from(&mut buf)) => r,
        };
        match received {
            Ok(Ok((len, from))) => on_datagram(&buf[..len], from),
            Ok(Err(e)) => debug!(error = %e, "receive failed"),
            Err(_) => {}
        }
    }
}
