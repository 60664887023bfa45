//! Raw IPv4 send socket

use lynx_common::{DriverError, DriverResult};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};

/// `IPPROTO_RAW` socket; the kernel takes our IPv4 header as-is.
pub struct RawSender {
    socket: Socket,
}

impl RawSender {
    pub fn open() -> DriverResult<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))
            .map_err(|e| DriverError::from_socket_error("raw IPv4 socket", e))?;
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        Ok(Self { socket })
    }

    pub fn send(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        self.socket.send_to(packet, &addr).map(|_| ())
    }
}

/// Local address the routing table picks for `dst`. Connecting a UDP socket
/// sends nothing.
pub fn source_for(dst: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect((dst, 9))?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(src) => Ok(src),
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no IPv4 route to target",
        )),
    }
}
