//! SSDP / UPnP discovery

use crate::{listen, ProbeContext};
use lynx_common::{DriverResult, DriverSummary, HostRecord};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const SSDP_GROUP: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);
const MIN_LISTEN: Duration = Duration::from_secs(3);

pub const SEARCH_TARGETS: &[&str] = &[
    "ssdp:all",
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
];

pub fn build_msearch(st: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {st}\r\n\
         \r\n"
    )
}

/// Headers of interest from an SSDP response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SsdpResponse {
    pub server: Option<String>,
    pub location: Option<String>,
}

/// Parse an HTTP-over-UDP response. Header names are case-insensitive.
pub fn parse_response(text: &str) -> Option<SsdpResponse> {
    let mut lines = text.lines();
    let status = lines.next()?;
    if !status.starts_with("HTTP/") && !status.starts_with("NOTIFY") {
        return None;
    }

    let mut response = SsdpResponse::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "server" => response.server = Some(value),
            "location" => response.location = Some(value),
            _ => {}
        }
    }
    Some(response)
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    let _ = socket.set_multicast_ttl_v4(2);

    for st in SEARCH_TARGETS {
        if let Err(e) = socket.send_to(build_msearch(st).as_bytes(), SSDP_GROUP).await {
            debug!(error = %e, st, "M-SEARCH send failed");
        }
    }

    let window = ctx.options.timeout().max(MIN_LISTEN);
    listen::collect(ctx, &socket, window, 2048, |data, from| {
        let ip = from.ip();
        if !ctx.target.contains(&ip) {
            return;
        }
        let Some(response) = parse_response(&String::from_utf8_lossy(data)) else {
            return;
        };
        debug!(
            %ip,
            server = response.server.as_deref().unwrap_or("-"),
            location = response.location.as_deref().unwrap_or("-"),
            "SSDP response"
        );
        ctx.sink.host(HostRecord::new(ip));
    })
    .await;

    Ok(ctx.summary(ctx.target.address_count() as usize))
}
