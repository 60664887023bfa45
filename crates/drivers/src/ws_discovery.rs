//! WS-Discovery (SOAP-over-UDP) probing
//!
//! Finds printers, scanners and Windows hosts that answer a multicast
//! `Probe` with a `ProbeMatch`.

use crate::{listen, ProbeContext};
use lynx_common::{DriverResult, DriverSummary, HostRecord};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;
use uuid::Uuid;

const WSD_GROUP: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 3702);
const MIN_LISTEN: Duration = Duration::from_secs(3);
const MAX_DATAGRAM: usize = 16384;
const RESEND_GAP: Duration = Duration::from_millis(100);

pub fn build_probe(message_id: &Uuid) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <soap:Header>
    <wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
    <wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
    <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>
  </soap:Header>
  <soap:Body>
    <wsd:Probe/>
  </soap:Body>
</soap:Envelope>"#
    )
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeMatch {
    pub types: Vec<String>,
    pub xaddrs: Vec<String>,
    pub scopes: Vec<String>,
}

/// Parse a `ProbeMatches` reply. Anything else yields `None`.
pub fn parse_probe_match(xml: &str) -> Option<ProbeMatch> {
    if !xml.contains("ProbeMatch") {
        return None;
    }
    Some(ProbeMatch {
        types: element_tokens(xml, "Types"),
        xaddrs: element_tokens(xml, "XAddrs"),
        scopes: element_tokens(xml, "Scopes"),
    })
}

/// Whitespace-separated text of every element with this local name,
/// whatever its namespace prefix.
fn element_tokens(xml: &str, local_name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = xml;

    while let Some(lt) = rest.find('<') {
        rest = &rest[lt + 1..];
        let Some(gt) = rest.find('>') else { break };
        let tag = &rest[..gt];
        rest = &rest[gt + 1..];

        if tag.starts_with('/') || tag.ends_with('/') {
            continue;
        }
        let name = tag.split_whitespace().next().unwrap_or_default();
        let local = name.rsplit(':').next().unwrap_or(name);
        if local != local_name {
            continue;
        }

        let end = rest.find('<').unwrap_or(rest.len());
        tokens.extend(rest[..end].split_whitespace().map(str::to_string));
    }
    tokens
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    let _ = socket.set_multicast_ttl_v4(1);

    let message = build_probe(&Uuid::new_v4());
    for attempt in 0..2 {
        if attempt > 0 && !ctx.pause(RESEND_GAP).await {
            return Ok(ctx.summary(0));
        }
        if let Err(e) = socket.send_to(message.as_bytes(), WSD_GROUP).await {
            debug!(error = %e, "WS-Discovery probe send failed");
        }
    }

    let window = ctx.options.timeout().max(MIN_LISTEN);
    listen::collect(ctx, &socket, window, MAX_DATAGRAM, |data, from| {
        let ip = from.ip();
        if !ctx.target.contains(&ip) {
            return;
        }
        let Some(matched) = parse_probe_match(&String::from_utf8_lossy(data)) else {
            return;
        };
        debug!(
            %ip,
            types = %matched.types.join(" "),
            xaddrs = %matched.xaddrs.join(" "),
            scopes = matched.scopes.len(),
            "WS-Discovery ProbeMatch"
        );
        ctx.sink.host(HostRecord::new(ip));
    })
    .await;

    Ok(ctx.summary(ctx.target.address_count() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
<s:Body><d:ProbeMatches><d:ProbeMatch>
<d:Types>wsdp:Device pub:Computer</d:Types>
<d:Scopes>onvif://www.onvif.org/type/video_encoder</d:Scopes>
<d:XAddrs>http://192.168.1.50:5357/abc http://[fe80::1]:5357/abc</d:XAddrs>
</d:ProbeMatch></d:ProbeMatches></s:Body></s:Envelope>"#;

    #[test]
    fn probe_has_message_id() {
        let id = Uuid::new_v4();
        let msg = build_probe(&id);
        assert!(msg.contains(&format!("urn:uuid:{id}")));
        assert!(msg.contains("<wsd:Probe/>"));
    }

    #[test]
    fn probe_match_fields() {
        let m = parse_probe_match(REPLY).unwrap();
        assert_eq!(m.types, vec!["wsdp:Device", "pub:Computer"]);
        assert_eq!(m.xaddrs.len(), 2);
        assert_eq!(m.scopes.len(), 1);
    }

    #[test]
    fn other_messages_ignored() {
        let id = Uuid::new_v4();
        assert!(parse_probe_match(&build_probe(&id)).is_none());
        assert!(parse_probe_match("hello").is_none());
    }
}
