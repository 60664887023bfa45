//! mDNS / DNS-SD discovery
//!
//! Sends PTR queries for the configured service types to 224.0.0.251:5353
//! with the unicast-response bit set, then collects answers until the
//! listen window closes.

use crate::{listen, ProbeContext};
use dns_parser::{Builder, Packet, QueryClass, QueryType, RData};
use lynx_common::{DriverError, DriverResult, DriverSummary, HostRecord};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const MDNS_GROUP: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)), 5353);
const SERVICE_ENUMERATION: &str = "_services._dns-sd._udp.local";
const MIN_LISTEN: Duration = Duration::from_secs(5);

/// Addresses and names learned from one response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MdnsAnswer {
    /// Address to owner name (A/AAAA), or `None` when only the source is known.
    pub hosts: BTreeMap<IpAddr, Option<String>>,
}

/// Build one query packet asking for every service type.
pub fn build_query(services: &[String]) -> Result<Vec<u8>, DriverError> {
    let mut builder = Builder::new_query(0, false);
    builder.add_question(SERVICE_ENUMERATION, true, QueryType::PTR, QueryClass::IN);
    for service in services {
        builder.add_question(service, true, QueryType::PTR, QueryClass::IN);
    }
    builder
        .build()
        .map_err(|_| DriverError::Failed("mDNS query exceeds one datagram".to_string()))
}

/// Extract hosts from a response datagram received from `source`.
pub fn parse_response(data: &[u8], source: IpAddr) -> Option<MdnsAnswer> {
    let packet = Packet::parse(data).ok()?;
    if packet.header.query {
        return None;
    }

    let mut answer = MdnsAnswer::default();
    let mut srv_target: Option<String> = None;

    for record in packet.answers.iter().chain(packet.additional.iter()) {
        match &record.data {
            RData::A(a) => {
                answer
                    .hosts
                    .insert(IpAddr::V4(a.0), Some(record.name.to_string()));
            }
            RData::AAAA(aaaa) => {
                answer
                    .hosts
                    .insert(IpAddr::V6(aaaa.0), Some(record.name.to_string()));
            }
            RData::SRV(srv) => srv_target = Some(srv.target.to_string()),
            RData::PTR(ptr) => debug!(%source, ptr = %ptr.0, "mDNS service instance"),
            _ => {}
        }
    }

    answer.hosts.entry(source).or_insert(srv_target);
    Some(answer)
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    let _ = socket.set_multicast_ttl_v4(255);

    let query = build_query(&ctx.options.mdns_services)?;
    socket.send_to(&query, MDNS_GROUP).await?;

    let window = ctx.options.timeout().max(MIN_LISTEN);
    let mut responders = 0usize;

    listen::collect(ctx, &socket, window, 9000, |data, from| {
        let Some(answer) = parse_response(data, from.ip()) else {
            return;
        };
        responders += 1;

        for (ip, name) in answer.hosts {
            if !ctx.target.contains(&ip) {
                continue;
            }
            let mut record = HostRecord::new(ip);
            if let Some(name) = name {
                record = record.with_hostname(name);
            }
            ctx.sink.host(record);
        }
    })
    .await;

    debug!(responders, "mDNS listen window closed");
    Ok(ctx.summary(ctx.target.address_count() as usize))
}
