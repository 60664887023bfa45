//! Active ARP sweep over a datalink channel
//!
//! Broadcasts who-has requests on every up, non-loopback interface whose IPv4
//! network covers part of the target space, and records each reply with its
//! MAC. Three rounds, unanswered targets only.

use crate::packet::ETHERNET_HEADER_LEN;
use crate::pacing::send_interval;
use crate::{join_error, ProbeContext};
use lynx_common::{DriverError, DriverResult, DriverSummary, HostRecord};
use pnet::datalink::{self, Channel, Config, MacAddr, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ARP_LEN: usize = 28;
const MIN_FRAME_LEN: usize = 60;
const ROUNDS: u32 = 3;
const MIN_ROUND: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A broadcast who-has frame, padded to the Ethernet minimum.
pub fn build_request(src_mac: MacAddr, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> Vec<u8> {
    let mut buffer = vec![0u8; MIN_FRAME_LEN];

    if let Some(mut eth) = MutableEthernetPacket::new(&mut buffer[..ETHERNET_HEADER_LEN]) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }
    if let Some(mut arp) =
        MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + ARP_LEN])
    {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(src_mac);
        arp.set_sender_proto_addr(src_addr);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(dst_addr);
    }
    buffer
}

/// Sender address and MAC of an ARP reply frame.
pub fn parse_reply(frame: &[u8]) -> Option<(Ipv4Addr, MacAddr)> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    Some((arp.get_sender_proto_addr(), arp.get_sender_hw_addr()))
}

/// One interface and the targets reachable on its link.
struct LinkPlan {
    interface: NetworkInterface,
    mac: MacAddr,
    source: Ipv4Addr,
    targets: Vec<Ipv4Addr>,
}

/// Group the on-link targets by interface. Each link walks whichever side is
/// smaller, its own subnet or the target space, and stops on cancellation.
fn plan_links(ctx: &ProbeContext) -> Vec<LinkPlan> {
    let mut plans = Vec::new();
    let mut assigned: HashSet<Ipv4Addr> = HashSet::new();
    let target_count = ctx.target.address_count();

    for iface in datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        let Some(mac) = iface.mac.filter(|m| *m != MacAddr::zero()) else {
            continue;
        };
        for net in &iface.ips {
            let IpNetwork::V4(v4) = net else { continue };
            let on_link = |t: &Ipv4Addr| *t != v4.ip() && !assigned.contains(t);
            let covered: Vec<Ipv4Addr> = if u128::from(v4.size()) <= target_count {
                v4.iter()
                    .take_while(|_| !ctx.cancel.is_cancelled())
                    .filter(|t| ctx.target.contains(&IpAddr::V4(*t)) && on_link(t))
                    .collect()
            } else {
                ctx.target
                    .ipv4_addresses()
                    .take_while(|_| !ctx.cancel.is_cancelled())
                    .filter(|t| v4.contains(*t) && on_link(t))
                    .collect()
            };
            if covered.is_empty() {
                continue;
            }
            assigned.extend(&covered);
            plans.push(LinkPlan {
                interface: iface.clone(),
                mac,
                source: v4.ip(),
                targets: covered,
            });
        }
    }
    plans
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    if !ctx.target.has_ipv4() {
        ctx.sink.info("no IPv4 targets for ARP");
        return Ok(ctx.summary(0));
    }
    let plans = plan_links(ctx);
    if plans.is_empty() {
        ctx.sink.info("no interface covers the targets");
        return Ok(ctx.summary(0));
    }

    let mut probed = 0;
    for plan in plans {
        if ctx.cancel.is_cancelled() {
            break;
        }
        probed += plan.targets.len();
        info!(
            interface = %plan.interface.name,
            targets = plan.targets.len(),
            "ARP sweep"
        );
        let worker_ctx = ctx.clone();
        tokio::task::spawn_blocking(move || sweep_link(&worker_ctx, plan))
            .await
            .map_err(join_error)??;
    }

    Ok(ctx.summary(probed))
}

fn sweep_link(ctx: &ProbeContext, plan: LinkPlan) -> DriverResult<()> {
    let config = Config {
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(&plan.interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(DriverError::Unsupported(format!(
                "{} is not an Ethernet interface",
                plan.interface.name
            )))
        }
        Err(e) => return Err(DriverError::from_socket_error("datalink channel", e)),
    };

    let round = (ctx.options.timeout() / ROUNDS).max(MIN_ROUND);
    let gap = send_interval(ctx.options.rate_limit);
    let mut sent: HashMap<Ipv4Addr, Instant> = HashMap::new();
    let mut pending: Vec<Ipv4Addr> = plan.targets.clone();

    for attempt in 0..ROUNDS {
        if attempt > 0 {
            std::thread::sleep(RETRY_DELAY);
        }

        for target in &pending {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let frame = build_request(plan.mac, plan.source, *target);
            match tx.send_to(&frame, None) {
                Some(Err(e)) if e.kind() == ErrorKind::PermissionDenied => {
                    return Err(DriverError::from_socket_error("ARP send", e));
                }
                Some(Err(e)) => debug!(%target, error = %e, "ARP send failed"),
                _ => {
                    sent.insert(*target, Instant::now());
                }
            }
            if let Some(gap) = gap {
                std::thread::sleep(gap);
            }
        }

        let deadline = Instant::now() + round;
        while Instant::now() < deadline && !pending.is_empty() {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let frame = match rx.next() {
                Ok(frame) => frame,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    continue
                }
                Err(e) => {
                    debug!(error = %e, "datalink receive failed");
                    continue;
                }
            };
            let Some((address, mac)) = parse_reply(frame) else {
                continue;
            };
            let Some(index) = pending.iter().position(|t| *t == address) else {
                continue;
            };
            pending.swap_remove(index);

            let mut record = HostRecord::new(IpAddr::V4(address)).with_mac(mac.to_string());
            if let Some(at) = sent.get(&address) {
                record = record.with_latency(at.elapsed());
            }
            ctx.sink.host(record);
        }

        if pending.is_empty() {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use lynx_common::{DiscoveryMethod, ScanOptions, TargetSpecification};

    fn reply_frame(sender: Ipv4Addr, mac: MacAddr) -> Vec<u8> {
        let mut frame = build_request(mac, sender, Ipv4Addr::new(192, 168, 1, 10));
        let mut arp =
            MutableArpPacket::new(&mut frame[ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + ARP_LEN])
                .unwrap();
        arp.set_operation(ArpOperations::Reply);
        frame
    }

    #[test]
    fn request_is_broadcast_who_has() {
        let src_mac = MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
        let frame = build_request(src_mac, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(frame.len(), MIN_FRAME_LEN);

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_destination(), MacAddr::broadcast());
        assert_eq!(eth.get_source(), src_mac);
        assert_eq!(eth.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(eth.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_proto_addr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(arp.get_target_proto_addr(), Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn reply_yields_sender() {
        let mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        let frame = reply_frame(Ipv4Addr::new(192, 168, 1, 1), mac);
        assert_eq!(parse_reply(&frame), Some((Ipv4Addr::new(192, 168, 1, 1), mac)));
    }

    #[test]
    fn requests_and_truncated_frames_ignored() {
        let mac = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let request = build_request(mac, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 9));
        assert!(parse_reply(&request).is_none());
        assert!(parse_reply(&request[..20]).is_none());
        assert!(parse_reply(&[]).is_none());
    }

    #[test]
    fn loopback_targets_have_no_link() {
        let spec = TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()]);
        let (ctx, _rx) = context(DiscoveryMethod::ArpScan, spec, ScanOptions::default());
        assert!(plan_links(&ctx).is_empty());
    }

    #[test]
    fn cancelled_planning_covers_nothing() {
        let spec = TargetSpecification::new(vec!["0.0.0.0/0".parse().unwrap()]);
        let (ctx, _rx) = context(DiscoveryMethod::ArpScan, spec, ScanOptions::default());
        ctx.cancel.cancel();
        assert!(plan_links(&ctx).is_empty());
    }
}
