//! Neighbour cache reader
//!
//! Reports every complete neighbour entry inside the target space, plus this
//! machine's own interface addresses, which never appear in its own cache.
//! Runs after a short delay so entries created by the other drivers' traffic
//! are already present.

use crate::ProbeContext;
use lynx_common::{DriverError, DriverResult, DriverSummary, HostRecord};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub address: Ipv4Addr,
    pub mac: String,
}

/// Parse Linux `/proc/net/arp`.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
/// ```
pub fn parse_proc_net_arp(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            // Flags 0x0 is an incomplete entry.
            if fields[2] == "0x0" {
                return None;
            }
            entry(fields[0], fields[3])
        })
        .collect()
}

/// Parse BSD/macOS `arp -an` output.
///
/// ```text
/// ? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
/// ? (192.168.1.7) at (incomplete) on en0 ifscope [ethernet]
/// ```
pub fn parse_arp_an(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .filter_map(|line| {
            let open = line.find('(')?;
            let close = line[open..].find(')')? + open;
            let ip = &line[open + 1..close];
            let after = line[close..].split_whitespace().collect::<Vec<_>>();
            let at = after.iter().position(|w| *w == "at")?;
            entry(ip, after.get(at + 1)?)
        })
        .collect()
}

fn entry(ip: &str, mac: &str) -> Option<NeighborEntry> {
    let address: Ipv4Addr = ip.parse().ok()?;
    let mac = normalize_mac(mac)?;
    Some(NeighborEntry { address, mac })
}

/// Lowercase, two digits per octet. Drops incomplete, all-zero and broadcast.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let octets: Vec<u8> = raw
        .split(':')
        .map(|p| u8::from_str_radix(p, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if octets.len() != 6 || octets.iter().all(|b| *b == 0) || octets.iter().all(|b| *b == 0xff) {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

async fn read_cache() -> DriverResult<Vec<NeighborEntry>> {
    if cfg!(target_os = "linux") {
        let text = tokio::fs::read_to_string("/proc/net/arp").await?;
        return Ok(parse_proc_net_arp(&text));
    }

    let output = tokio::process::Command::new("arp")
        .arg("-an")
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DriverError::Unsupported("arp command not available".to_string())
            }
            _ => DriverError::Io(e),
        })?;
    if !output.status.success() {
        return Err(DriverError::Failed(format!(
            "arp -an exited with {}",
            output.status
        )));
    }
    Ok(parse_arp_an(&String::from_utf8_lossy(&output.stdout)))
}

/// This machine's addresses, with the interface MAC where there is one.
fn local_addresses() -> Vec<(IpAddr, Option<String>)> {
    pnet::datalink::interfaces()
        .into_iter()
        .flat_map(|iface| {
            let mac = iface
                .mac
                .and_then(|m| normalize_mac(&m.to_string()));
            iface
                .ips
                .iter()
                .map(|net| (net.ip(), mac.clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

pub async fn probe(ctx: &ProbeContext) -> DriverResult<DriverSummary> {
    if !ctx.pause(SETTLE_DELAY).await {
        return Ok(ctx.summary(0));
    }

    let entries = read_cache().await?;
    debug!(entries = entries.len(), "neighbour cache read");

    for entry in &entries {
        let ip = IpAddr::V4(entry.address);
        if ctx.target.contains(&ip) {
            ctx.sink.host(HostRecord::new(ip).with_mac(&entry.mac));
        }
    }

    for (ip, mac) in local_addresses() {
        if !ctx.target.contains(&ip) {
            continue;
        }
        let mut record = HostRecord::new(ip);
        if let Some(mac) = mac {
            record = record.with_mac(mac);
        }
        ctx.sink.host(record);
    }

    Ok(ctx.summary(entries.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, drain_hosts};
    use lynx_common::{DiscoveryMethod, ScanOptions, TargetSpecification};

    #[test]
    fn proc_net_arp_skips_incomplete() {
        let text = "IP address       HW type     Flags       HW address            Mask     Device\n\
                    192.168.1.1      0x1         0x2         AA:BB:CC:DD:EE:FF     *        eth0\n\
                    192.168.1.9      0x1         0x0         00:00:00:00:00:00     *        eth0\n\
                    192.168.1.10     0x1         0x2         ff:ff:ff:ff:ff:ff     *        eth0\n";
        let entries = parse_proc_net_arp(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(entries[0].mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn arp_an_normalizes_short_octets() {
        let text = "? (192.168.1.1) at 0:1b:2c:d:e:f on en0 ifscope [ethernet]\n\
                    ? (192.168.1.7) at (incomplete) on en0 ifscope [ethernet]\n\
                    router.lan (192.168.1.254) at a4:91:b1:00:00:01 on en0 [ethernet]\n";
        let entries = parse_arp_an(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mac, "00:1b:2c:0d:0e:0f");
        assert_eq!(entries[1].address, Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn mac_normalization_rejects_placeholders() {
        assert!(normalize_mac("00:00:00:00:00:00").is_none());
        assert!(normalize_mac("FF:FF:FF:FF:FF:FF").is_none());
        assert!(normalize_mac("(incomplete)").is_none());
        assert!(normalize_mac("aa:bb:cc").is_none());
    }

    #[tokio::test]
    async fn only_target_addresses_are_reported() {
        let spec = TargetSpecification::new(vec!["127.0.0.1".parse().unwrap()]);
        let (ctx, mut rx) = context(DiscoveryMethod::ArpCache, spec, ScanOptions::default());
        let summary = probe(&ctx).await.unwrap();

        let hosts = drain_hosts(&mut rx);
        assert!(summary.hosts_found <= 1);
        assert!(hosts.iter().all(|h| h.address == IpAddr::from([127, 0, 0, 1])));
    }
}
