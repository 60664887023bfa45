//! Target Resolver - address block parsing, port lists, and DNS resolution
//!
//! Takes the user-facing target and port notation and turns it into a
//! [`TargetSpecification`]. Supported target token forms:
//! - single address: "1.2.3.4", "fe80::1"
//! - CIDR: "192.168.1.0/24"
//! - range: "192.168.1.1-192.168.1.10"
//! - hostname: "printer.lan" (resolved through the system DNS configuration)
//!
//! Port tokens are single ports, ranges, or one of the presets `web`,
//! `common`, `all`.

use anyhow::{Context, Result};
use lynx_common::{host_limit, AddressBlock, PortRange, SpecError, TargetSpecification};
use std::net::IpAddr;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

pub const WEB_PORTS: &[u16] = &[80, 443, 8000, 8008, 8080, 8081, 8443, 8888];

pub const COMMON_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 548, 631, 993, 995, 1433, 3306, 3389,
    5900, 6379, 8080, 8443,
];

pub struct TargetResolver;

impl TargetResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a comma-separated target string plus optional port notation.
    ///
    /// Literal blocks are parsed synchronously; hostnames are looked up
    /// through trust-dns and each resolved address becomes a single block.
    pub async fn resolve(targets: &str, ports: Option<&str>) -> Result<TargetSpecification> {
        if targets.trim().is_empty() {
            anyhow::bail!("No targets specified");
        }

        let limit = host_limit();
        let mut blocks: Vec<AddressBlock> = Vec::new();
        let mut hostnames: Vec<String> = Vec::new();

        for token in targets.split(',') {
            let t = token.trim();
            if t.is_empty() {
                continue;
            }

            match t.parse::<AddressBlock>() {
                Ok(block) => {
                    check_block_size(&block, limit)?;
                    if !blocks.contains(&block) {
                        blocks.push(block);
                    }
                }
                Err(_) if looks_like_hostname(t) => hostnames.push(t.to_string()),
                Err(e) => return Err(e.into()),
            }
        }

        if !hostnames.is_empty() {
            for ip in resolve_hostnames(&hostnames).await? {
                let block = AddressBlock::Single(ip);
                if !blocks.contains(&block) {
                    blocks.push(block);
                }
            }
        }

        if blocks.is_empty() {
            anyhow::bail!("No valid addresses found in targets");
        }

        let ports = match ports {
            Some(p) => parse_ports(p)?,
            None => Vec::new(),
        };

        let spec = TargetSpecification::new(blocks).with_ports(ports);
        spec.check_size(limit)?;
        Ok(spec)
    }
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Refuse a block holding more than `limit` addresses.
///
/// The limit comes from [`host_limit`], which `LYNX_ALLOW_LARGE_CIDR=1` raises.
pub fn check_block_size(block: &AddressBlock, limit: u128) -> Result<(), SpecError> {
    let count = block.len();
    if count > limit {
        return Err(SpecError::TooLarge {
            block: block.to_string(),
            count,
            limit,
        });
    }
    Ok(())
}

fn looks_like_hostname(t: &str) -> bool {
    t.chars().any(|c| c.is_ascii_alphabetic())
        && t.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

async fn resolve_hostnames(hostnames: &[String]) -> Result<Vec<IpAddr>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .context("Failed to load system DNS configuration")?;

    let mut ips = Vec::new();
    for host in hostnames {
        match resolver.lookup_ip(host.as_str()).await {
            Ok(lookup) => {
                for ip in lookup.iter() {
                    debug!(host = %host, %ip, "resolved target hostname");
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            Err(e) => debug!(host = %host, error = %e, "hostname did not resolve"),
        }
    }
    Ok(ips)
}

/// Parse comma-separated port notation into ranges.
///
/// Presets expand in place: `web`, `common`, `all` (1-65535).
pub fn parse_ports(ports_str: &str) -> Result<Vec<PortRange>> {
    let mut ports = Vec::new();

    for part in ports_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.to_ascii_lowercase().as_str() {
            "web" => ports.extend(WEB_PORTS.iter().copied().map(PortRange::single)),
            "common" => ports.extend(COMMON_PORTS.iter().copied().map(PortRange::single)),
            "all" => ports.push(PortRange {
                start: 1,
                end: u16::MAX,
            }),
            _ => {
                let range: PortRange = part
                    .parse()
                    .with_context(|| format!("Invalid port: {}", part))?;
                ports.push(range);
            }
        }
    }

    if ports.is_empty() {
        anyhow::bail!("No ports specified");
    }
    Ok(ports)
}
