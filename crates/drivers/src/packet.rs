//! Hand-built IPv4 packets for the raw-socket drivers
//!
//! TCP SYN probes (IPv4 header included, for `IPPROTO_RAW`) and ICMP echo
//! requests (ICMP only, the kernel adds the IP header). Parsers take a full
//! IPv4 datagram as delivered by raw and packet sockets.

use std::net::Ipv4Addr;

/// TCP flag constants
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const SYN_PACKET_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
pub const ETHERNET_HEADER_LEN: usize = 14;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;

/// Build an IPv4 + TCP SYN packet into `buf`. Returns the bytes written, or 0
/// when `buf` is too short.
pub fn build_ipv4_syn(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
) -> usize {
    if buf.len() < SYN_PACKET_LEN {
        return 0;
    }

    // IPv4 header
    buf[0] = 0x45;
    buf[1] = 0x00;
    buf[2..4].copy_from_slice(&(SYN_PACKET_LEN as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    buf[8] = 64;
    buf[9] = PROTO_TCP;
    buf[10..12].copy_from_slice(&[0, 0]);
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let ip_checksum = checksum(&buf[0..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    // TCP header
    let tcp = &mut buf[IPV4_HEADER_LEN..SYN_PACKET_LEN];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&0u32.to_be_bytes());
    tcp[12] = 0x50; // data offset 5
    tcp[13] = tcp_flags::SYN;
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    tcp[16..18].copy_from_slice(&[0, 0]);
    tcp[18..20].copy_from_slice(&[0, 0]);
    let tcp_checksum = tcp_checksum_v4(src, dst, tcp);
    tcp[16..18].copy_from_slice(&tcp_checksum.to_be_bytes());

    SYN_PACKET_LEN
}

/// TCP header fields relevant for matching a SYN answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpSegment {
    #[inline]
    pub fn is_syn_ack(&self) -> bool {
        self.flags & tcp_flags::SYN != 0 && self.flags & tcp_flags::ACK != 0
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags & tcp_flags::RST != 0
    }
}

/// Parse an IPv4 datagram carrying TCP.
pub fn parse_tcp_segment(buf: &[u8]) -> Option<TcpSegment> {
    let (ihl, protocol) = ipv4_header(buf)?;
    if protocol != PROTO_TCP {
        return None;
    }
    let tcp = buf.get(ihl..)?;
    if tcp.len() < TCP_HEADER_LEN {
        return None;
    }

    Some(TcpSegment {
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        flags: tcp[13],
    })
}

/// Build an ICMP echo request with a 32-byte payload.
pub fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + 32];
    buf[0] = ICMP_ECHO_REQUEST;
    buf[1] = 0;
    buf[4..6].copy_from_slice(&identifier.to_be_bytes());
    buf[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, b) in buf[8..].iter_mut().enumerate() {
        *b = i as u8;
    }
    let sum = checksum(&buf);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub source: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
}

/// Parse an IPv4 datagram carrying an ICMP echo reply.
pub fn parse_echo_reply(buf: &[u8]) -> Option<EchoReply> {
    let (ihl, protocol) = ipv4_header(buf)?;
    if protocol != PROTO_ICMP {
        return None;
    }
    let icmp = buf.get(ihl..)?;
    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY || icmp[1] != 0 {
        return None;
    }

    Some(EchoReply {
        source: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// Header length and protocol of an IPv4 datagram.
fn ipv4_header(buf: &[u8]) -> Option<(usize, u8)> {
    if buf.len() < IPV4_HEADER_LEN || buf[0] >> 4 != 4 {
        return None;
    }
    let ihl = (buf[0] & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_LEN || buf.len() < ihl {
        return None;
    }
    Some((ihl, buf[9]))
}

/// Internet checksum (RFC 1071).
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// TCP checksum with IPv4 pseudo-header
#[inline]
fn tcp_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, tcp_data: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += u32::from(PROTO_TCP);
    sum += tcp_data.len() as u32;
    fold(sum_words(tcp_data, sum))
}

#[inline]
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

#[inline]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ipv4_syn() {
        let mut buf = vec![0u8; 60];
        let src = Ipv4Addr::new(192, 168, 1, 1);
        let dst = Ipv4Addr::new(192, 168, 1, 2);

        let len = build_ipv4_syn(&mut buf, src, dst, 12345, 80, 1000);
        assert_eq!(len, 40);
        assert_eq!(buf[0] >> 4, 4);
        assert_eq!(buf[9], 6);
        assert_eq!(buf[33], tcp_flags::SYN);

        // A correct header checksums to zero.
        assert_eq!(checksum(&buf[..20]), 0);
        assert_eq!(tcp_checksum_v4(src, dst, &buf[20..40]), 0);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut buf = [0u8; 30];
        let ip = Ipv4Addr::LOCALHOST;
        assert_eq!(build_ipv4_syn(&mut buf, ip, ip, 1, 2, 3), 0);
    }

    #[test]
    fn test_parse_syn_ack() {
        let mut buf = vec![0u8; 40];
        let server = Ipv4Addr::new(10, 0, 0, 2);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        build_ipv4_syn(&mut buf, server, client, 443, 50000, 1);
        buf[33] = tcp_flags::SYN | tcp_flags::ACK;

        let seg = parse_tcp_segment(&buf).unwrap();
        assert_eq!(seg.src, server);
        assert_eq!(seg.dst, client);
        assert_eq!(seg.src_port, 443);
        assert_eq!(seg.dst_port, 50000);
        assert!(seg.is_syn_ack());
        assert!(!seg.is_rst());

        buf[33] = tcp_flags::RST | tcp_flags::ACK;
        let seg = parse_tcp_segment(&buf).unwrap();
        assert!(seg.is_rst());
        assert!(!seg.is_syn_ack());
    }

    #[test]
    fn test_echo_request_checksum() {
        let pkt = build_echo_request(0xBEEF, 3);
        assert_eq!(pkt[0], 8);
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn test_parse_echo_reply() {
        let mut icmp = build_echo_request(0x1234, 2);
        icmp[0] = 0;
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram[9] = 1;
        datagram[12..16].copy_from_slice(&[192, 168, 0, 9]);
        datagram.extend_from_slice(&icmp);

        let reply = parse_echo_reply(&datagram).unwrap();
        assert_eq!(reply.source, Ipv4Addr::new(192, 168, 0, 9));
        assert_eq!(reply.identifier, 0x1234);
        assert_eq!(reply.sequence, 2);

        // An echo request is not a reply.
        datagram[20] = 8;
        assert!(parse_echo_reply(&datagram).is_none());
    }

    #[test]
    fn test_non_ipv4_ignored() {
        assert!(parse_tcp_segment(&[0x60; 60]).is_none());
        assert!(parse_echo_reply(&[0x45; 10]).is_none());
    }
}
