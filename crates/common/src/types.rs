//! Core data types for the Lynx discovery core
//!
//! Every type here crosses a process boundary sooner or later (worker stdout,
//! daemon socket), so all of them are serde-friendly and use camelCase field
//! names on the wire. Builder methods consume `self`, following the style of
//! the rest of the workspace.

use chrono::{DateTime, Utc};
use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SpecError;

/// One of the nine discovery techniques.
///
/// The set is closed; dispatch happens by `match` on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    TcpConnect,
    Mdns,
    Ssdp,
    WsDiscovery,
    ArpCache,
    UdpProbe,
    IcmpEcho,
    ArpScan,
    TcpSyn,
}

impl DiscoveryMethod {
    pub const ALL: [DiscoveryMethod; 9] = [
        DiscoveryMethod::TcpConnect,
        DiscoveryMethod::Mdns,
        DiscoveryMethod::Ssdp,
        DiscoveryMethod::WsDiscovery,
        DiscoveryMethod::ArpCache,
        DiscoveryMethod::UdpProbe,
        DiscoveryMethod::IcmpEcho,
        DiscoveryMethod::ArpScan,
        DiscoveryMethod::TcpSyn,
    ];

    /// Whether the driver needs raw-socket access.
    #[inline]
    #[must_use]
    pub const fn requires_privilege(&self) -> bool {
        matches!(
            self,
            DiscoveryMethod::IcmpEcho | DiscoveryMethod::ArpScan | DiscoveryMethod::TcpSyn
        )
    }

    /// Wire name, identical to the serde representation.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::TcpConnect => "tcp_connect",
            DiscoveryMethod::Mdns => "mdns",
            DiscoveryMethod::Ssdp => "ssdp",
            DiscoveryMethod::WsDiscovery => "ws_discovery",
            DiscoveryMethod::ArpCache => "arp_cache",
            DiscoveryMethod::UdpProbe => "udp_probe",
            DiscoveryMethod::IcmpEcho => "icmp_echo",
            DiscoveryMethod::ArpScan => "arp_scan",
            DiscoveryMethod::TcpSyn => "tcp_syn",
        }
    }

    /// Human-readable label used in log lines.
    #[inline]
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            DiscoveryMethod::TcpConnect => "TCP-Connect",
            DiscoveryMethod::Mdns => "mDNS",
            DiscoveryMethod::Ssdp => "SSDP",
            DiscoveryMethod::WsDiscovery => "WS-Discovery",
            DiscoveryMethod::ArpCache => "ARP-cache",
            DiscoveryMethod::UdpProbe => "UDP",
            DiscoveryMethod::IcmpEcho => "ICMP",
            DiscoveryMethod::ArpScan => "ARP",
            DiscoveryMethod::TcpSyn => "TCP-SYN",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DiscoveryMethod {
    type Err = SpecError;

    /// Accepts wire names, labels, and a few short aliases, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        let method = match key.as_str() {
            "tcp_connect" | "tcp" | "connect" => DiscoveryMethod::TcpConnect,
            "mdns" | "bonjour" => DiscoveryMethod::Mdns,
            "ssdp" | "upnp" => DiscoveryMethod::Ssdp,
            "ws_discovery" | "wsd" => DiscoveryMethod::WsDiscovery,
            "arp_cache" | "neighbors" => DiscoveryMethod::ArpCache,
            "udp_probe" | "udp" => DiscoveryMethod::UdpProbe,
            "icmp_echo" | "icmp" | "ping" => DiscoveryMethod::IcmpEcho,
            "arp_scan" | "arp" => DiscoveryMethod::ArpScan,
            "tcp_syn" | "syn" => DiscoveryMethod::TcpSyn,
            _ => return Err(SpecError::UnknownMethod(s.to_string())),
        };
        Ok(method)
    }
}

/// One address block of a target specification.
///
/// Serialized as its textual form: `10.0.0.5`, `10.0.0.1-10.0.0.9`, `10.0.0.0/30`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressBlock {
    Single(IpAddr),
    Range(IpAddr, IpAddr),
    Network(IpNet),
}

impl AddressBlock {
    /// First and last address as integers, plus the address family.
    fn bounds(&self) -> (u128, u128, bool) {
        match self {
            AddressBlock::Single(ip) => {
                let v = ip_to_u128(ip);
                (v, v, ip.is_ipv6())
            }
            AddressBlock::Range(start, end) => (ip_to_u128(start), ip_to_u128(end), start.is_ipv6()),
            AddressBlock::Network(net) => (
                ip_to_u128(&net.network()),
                ip_to_u128(&net.broadcast()),
                matches!(net, IpNet::V6(_)),
            ),
        }
    }

    /// Number of addresses in the block (every address, network and broadcast included).
    #[must_use]
    pub fn len(&self) -> u128 {
        let (first, last, _) = self.bounds();
        (last - first).saturating_add(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.bounds().2
    }

    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let (first, last, v6) = self.bounds();
        if ip.is_ipv6() != v6 {
            return false;
        }
        let v = ip_to_u128(ip);
        v >= first && v <= last
    }

    /// Every address of the block, lazily, network and broadcast included.
    #[must_use]
    pub fn addresses(&self) -> IpAddrRange {
        match self {
            AddressBlock::Single(IpAddr::V4(ip)) => Ipv4AddrRange::new(*ip, *ip).into(),
            AddressBlock::Single(IpAddr::V6(ip)) => Ipv6AddrRange::new(*ip, *ip).into(),
            AddressBlock::Range(IpAddr::V4(start), IpAddr::V4(end)) => {
                Ipv4AddrRange::new(*start, *end).into()
            }
            AddressBlock::Range(IpAddr::V6(start), IpAddr::V6(end)) => {
                Ipv6AddrRange::new(*start, *end).into()
            }
            // Parsing never yields a mixed-family range.
            AddressBlock::Range(..) => IpAddrRange::V4(Ipv4AddrRange::new(
                Ipv4Addr::BROADCAST,
                Ipv4Addr::UNSPECIFIED,
            )),
            AddressBlock::Network(IpNet::V4(net)) => {
                Ipv4AddrRange::new(net.network(), net.broadcast()).into()
            }
            AddressBlock::Network(IpNet::V6(net)) => {
                Ipv6AddrRange::new(net.network(), net.broadcast()).into()
            }
        }
    }
}

impl FromStr for AddressBlock {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.contains('/') {
            let net: IpNet = t
                .parse()
                .map_err(|_| SpecError::InvalidBlock(t.to_string()))?;
            return Ok(AddressBlock::Network(net.trunc()));
        }

        if let Some((start, end)) = t.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| SpecError::InvalidBlock(t.to_string()))?;
            let end: IpAddr = end
                .trim()
                .parse()
                .map_err(|_| SpecError::InvalidBlock(t.to_string()))?;
            if start.is_ipv6() != end.is_ipv6() || ip_to_u128(&start) > ip_to_u128(&end) {
                return Err(SpecError::InvalidBlock(t.to_string()));
            }
            return Ok(AddressBlock::Range(start, end));
        }

        t.parse::<IpAddr>()
            .map(AddressBlock::Single)
            .map_err(|_| SpecError::InvalidBlock(t.to_string()))
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressBlock::Single(ip) => write!(f, "{ip}"),
            AddressBlock::Range(start, end) => write!(f, "{start}-{end}"),
            AddressBlock::Network(net) => write!(f, "{net}"),
        }
    }
}

impl TryFrom<String> for AddressBlock {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressBlock> for String {
    fn from(block: AddressBlock) -> Self {
        block.to_string()
    }
}

#[inline]
fn ip_to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// Inclusive port range, serialized as `80` or `1-1024`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[inline]
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl FromStr for PortRange {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| SpecError::InvalidPort(t.to_string()))
        };
        let (start, end) = match t.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let p = parse(t)?;
                (p, p)
            }
        };
        if start == 0 || start > end {
            return Err(SpecError::InvalidPort(t.to_string()));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

/// Addresses one request may cover.
pub const MAX_HOSTS: u128 = 4096;

/// Ceiling once [`ALLOW_LARGE_ENV`] lifts [`MAX_HOSTS`]: a /12.
pub const MAX_HOSTS_LARGE: u128 = 1 << 20;

/// Environment switch that lifts [`MAX_HOSTS`] to [`MAX_HOSTS_LARGE`].
pub const ALLOW_LARGE_ENV: &str = "LYNX_ALLOW_LARGE_CIDR";

/// Highest accepted `retries` option.
pub const MAX_RETRIES: u32 = 10;

/// Host limit for this process.
#[must_use]
pub fn host_limit() -> u128 {
    match std::env::var(ALLOW_LARGE_ENV) {
        Ok(v) if v == "1" => MAX_HOSTS_LARGE,
        _ => MAX_HOSTS,
    }
}

/// Address blocks plus port ranges to probe. Immutable once a scan starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpecification {
    pub blocks: Vec<AddressBlock>,
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

impl TargetSpecification {
    #[inline]
    #[must_use]
    pub fn new(blocks: Vec<AddressBlock>) -> Self {
        Self {
            blocks,
            ports: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<PortRange>) -> Self {
        self.ports = ports;
        self
    }

    /// Upper bound on the number of addresses (overlapping blocks counted twice).
    #[must_use]
    pub fn address_count(&self) -> u128 {
        self.blocks
            .iter()
            .fold(0u128, |acc, b| acc.saturating_add(b.len()))
    }

    /// Every address of every block, each once, in block order.
    ///
    /// Lazy: nothing is expanded up front, and an address already covered by
    /// an earlier block is skipped.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.unique_addresses(|_| true)
    }

    /// IPv4 subset of [`addresses`](Self::addresses). IPv6 blocks are never walked.
    pub fn ipv4_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.unique_addresses(|b| !b.is_ipv6())
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
    }

    #[must_use]
    pub fn has_ipv4(&self) -> bool {
        self.blocks.iter().any(|b| !b.is_ipv6())
    }

    fn unique_addresses<'a, F>(&'a self, keep: F) -> impl Iterator<Item = IpAddr> + 'a
    where
        F: Fn(&AddressBlock) -> bool + 'a,
    {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(_, block)| keep(block))
            .flat_map(move |(i, block)| {
                let earlier = &self.blocks[..i];
                block
                    .addresses()
                    .filter(move |ip| !earlier.iter().any(|b| b.contains(ip)))
            })
    }

    /// Refuse a target space above `limit` addresses.
    pub fn check_size(&self, limit: u128) -> Result<(), SpecError> {
        let count = self.address_count();
        if count > limit {
            let blocks: Vec<String> = self.blocks.iter().map(ToString::to_string).collect();
            return Err(SpecError::TooLarge {
                block: blocks.join(","),
                count,
                limit,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.blocks.iter().any(|b| b.contains(ip))
    }

    /// Requested ports, deduplicated, in request order.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        self.ports
            .iter()
            .flat_map(PortRange::iter)
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Requested ports, or `defaults` when none were requested.
    #[must_use]
    pub fn ports_or(&self, defaults: &[u16]) -> Vec<u16> {
        let ports = self.ports();
        if ports.is_empty() {
            defaults.to_vec()
        } else {
            ports
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A discovered host, possibly partial.
///
/// Partial records for the same address are combined with [`HostRecord::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub methods: BTreeSet<DiscoveryMethod>,
    #[serde(default)]
    pub open_ports: BTreeSet<u16>,
    /// Best observed round-trip time, in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    pub discovered_at: DateTime<Utc>,
}

impl HostRecord {
    #[inline]
    #[must_use]
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            mac: None,
            hostname: None,
            methods: BTreeSet::new(),
            open_ports: BTreeSet::new(),
            latency_us: None,
            discovered_at: Utc::now(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_method(mut self, method: DiscoveryMethod) -> Self {
        self.methods.insert(method);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.open_ports.insert(port);
        self
    }

    /// Builder: attach a MAC address (normalized to lowercase).
    #[inline]
    #[must_use]
    pub fn with_mac<S: AsRef<str>>(mut self, mac: S) -> Self {
        self.mac = Some(mac.as_ref().to_ascii_lowercase());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_latency(mut self, rtt: Duration) -> Self {
        self.latency_us = Some(rtt.as_micros().min(u128::from(u64::MAX)) as u64);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }

    #[inline]
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency_us.map(Duration::from_micros)
    }

    /// Fold `other` into `self`. Returns true when `self` changed.
    ///
    /// Methods and ports are unioned, latency and timestamp take the minimum,
    /// MAC and hostname take the smallest present value. The operation is
    /// associative, commutative, and idempotent. Records for different
    /// addresses are left untouched.
    pub fn merge(&mut self, other: &HostRecord) -> bool {
        if self.address != other.address {
            return false;
        }

        let mut changed = false;

        for method in &other.methods {
            changed |= self.methods.insert(*method);
        }
        for port in &other.open_ports {
            changed |= self.open_ports.insert(*port);
        }

        changed |= merge_min(&mut self.latency_us, other.latency_us);
        changed |= merge_min(&mut self.mac, other.mac.clone());
        changed |= merge_min(&mut self.hostname, other.hostname.clone());

        if other.discovered_at < self.discovered_at {
            self.discovered_at = other.discovered_at;
            changed = true;
        }

        changed
    }

    /// Merged copy of two records for the same address.
    #[must_use]
    pub fn merged(mut self, other: &HostRecord) -> Self {
        self.merge(other);
        self
    }
}

/// Keep the smallest present value. Returns true when `slot` changed.
fn merge_min<T: Ord>(slot: &mut Option<T>, candidate: Option<T>) -> bool {
    match (slot.as_ref(), candidate) {
        (_, None) => false,
        (None, Some(c)) => {
            *slot = Some(c);
            true
        }
        (Some(current), Some(c)) => {
            if c < *current {
                *slot = Some(c);
                true
            } else {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Status or diagnostic message carried in the result stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DiscoveryMethod>,
    pub message: String,
}

impl LogLine {
    #[inline]
    #[must_use]
    pub fn new<S: Into<String>>(level: LogLevel, message: S) -> Self {
        Self {
            level,
            method: None,
            message: message.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn info<S: Into<String>>(message: S) -> Self {
        Self::new(LogLevel::Info, message)
    }

    #[inline]
    #[must_use]
    pub fn warn<S: Into<String>>(message: S) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    #[inline]
    #[must_use]
    pub fn with_method(mut self, method: DiscoveryMethod) -> Self {
        self.method = Some(method);
        self
    }
}

/// Lifecycle of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Completed => "completed",
            OperationState::Cancelled => "cancelled",
            OperationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Completed,
    Cancelled,
}

/// Outcome of one driver run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub method: DiscoveryMethod,
    pub status: DriverStatus,
    pub targets_probed: usize,
    pub hosts_found: usize,
}

impl DriverSummary {
    #[inline]
    #[must_use]
    pub fn new(method: DiscoveryMethod, cancelled: bool) -> Self {
        Self {
            method,
            status: if cancelled {
                DriverStatus::Cancelled
            } else {
                DriverStatus::Completed
            },
            targets_probed: 0,
            hosts_found: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_counts(mut self, targets_probed: usize, hosts_found: usize) -> Self {
        self.targets_probed = targets_probed;
        self.hosts_found = hosts_found;
        self
    }
}

/// Why a method produced no (or partial) results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodFailure {
    pub method: DiscoveryMethod,
    pub reason: String,
}

/// Terminal record of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub operation_id: String,
    pub state: OperationState,
    pub hosts_found: usize,
    pub per_method: BTreeMap<DiscoveryMethod, usize>,
    pub methods_attempted: Vec<DiscoveryMethod>,
    pub methods_skipped: Vec<DiscoveryMethod>,
    pub failures: Vec<MethodFailure>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub hosts: Vec<HostRecord>,
}

/// One line of the streamed result protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressRecord {
    Host(HostRecord),
    Log(LogLine),
    Completed(ScanSummary),
}

impl ProgressRecord {
    /// Wire tags understood by this version; anything else is ignorable.
    pub const KNOWN_TYPES: [&'static str; 3] = ["host", "log", "completed"];
}

/// Host discovery stops at first evidence; scan mode probes every port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    Discover,
    Scan,
}

/// Service types queried by the mDNS driver when none are configured.
pub const DEFAULT_MDNS_SERVICES: &[&str] = &[
    "_http._tcp.local",
    "_https._tcp.local",
    "_ssh._tcp.local",
    "_smb._tcp.local",
    "_afpovertcp._tcp.local",
    "_ipp._tcp.local",
    "_printer._tcp.local",
    "_airplay._tcp.local",
    "_raop._tcp.local",
    "_googlecast._tcp.local",
    "_spotify-connect._tcp.local",
    "_hap._tcp.local",
    "_homekit._tcp.local",
    "_workstation._tcp.local",
    "_device-info._tcp.local",
];

/// Scan behaviour tuning options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanOptions {
    /// Per-target base timeout; each driver scales it for its technique.
    pub timeout_ms: u64,
    /// Wall-clock ceiling across all drivers.
    pub global_timeout_ms: u64,
    pub concurrency: usize,
    pub retries: u32,
    /// Probes per second for paced drivers.
    pub rate_limit: Option<u64>,
    pub mode: ScanMode,
    pub mdns_services: Vec<String>,
    /// Look up PTR names for discovered hosts once the drivers finish.
    pub resolve_hostnames: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            global_timeout_ms: 120_000,
            concurrency: 100,
            retries: 2,
            rate_limit: None,
            mode: ScanMode::Discover,
            mdns_services: DEFAULT_MDNS_SERVICES.iter().map(|s| s.to_string()).collect(),
            resolve_hostnames: false,
        }
    }
}

impl ScanOptions {
    /// Fast preset: short timeouts, single retry, high concurrency.
    #[inline]
    #[must_use]
    pub fn fast() -> Self {
        Self {
            timeout_ms: 500,
            global_timeout_ms: 30_000,
            concurrency: 500,
            retries: 1,
            ..Self::default()
        }
    }

    /// Accurate preset: longer timeouts and more retries.
    #[inline]
    #[must_use]
    pub fn accurate() -> Self {
        Self {
            timeout_ms: 3_000,
            global_timeout_ms: 300_000,
            concurrency: 50,
            retries: 3,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    #[inline]
    #[must_use]
    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms.max(1))
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: Option<u64>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_resolve_hostnames(mut self, resolve: bool) -> Self {
        self.resolve_hostnames = resolve;
        self
    }
}

/// Request payload shared by the orchestrator, the daemon, and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub operation_id: String,
    pub target_spec: TargetSpecification,
    pub methods: Vec<DiscoveryMethod>,
    #[serde(default)]
    pub options: ScanOptions,
}

impl ScanRequest {
    /// New request with a freshly generated operation ID.
    #[must_use]
    pub fn new(target_spec: TargetSpecification, methods: Vec<DiscoveryMethod>) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            target_spec,
            methods,
            options: ScanOptions::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_operation_id<S: Into<String>>(mut self, operation_id: S) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    /// Reject requests no driver should start on: a target space above
    /// [`host_limit`] or an out-of-range retry count.
    pub fn validate(&self) -> Result<(), SpecError> {
        self.validate_with_limit(host_limit())
    }

    pub fn validate_with_limit(&self, limit: u128) -> Result<(), SpecError> {
        self.target_spec.check_size(limit)?;
        if self.options.retries > MAX_RETRIES {
            return Err(SpecError::InvalidOption(format!(
                "retries {} exceeds {}",
                self.options.retries, MAX_RETRIES
            )));
        }
        Ok(())
    }

    /// Copy of this request restricted to `methods`, same operation ID.
    ///
    /// Name lookup stays with the caller, which sees every method's hosts.
    #[must_use]
    pub fn restricted_to(&self, methods: &[DiscoveryMethod]) -> Self {
        Self {
            operation_id: self.operation_id.clone(),
            target_spec: self.target_spec.clone(),
            methods: methods.to_vec(),
            options: self.options.clone().with_resolve_hostnames(false),
        }
    }
}

/// One JSON line on the worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Discover(ScanRequest),
    Scan(ScanRequest),
    Check,
    Methods,
}

impl WorkerCommand {
    /// Discover or scan command for `request`, chosen by its mode.
    #[must_use]
    pub fn for_request(request: ScanRequest) -> Self {
        match request.options.mode {
            ScanMode::Discover => WorkerCommand::Discover(request),
            ScanMode::Scan => WorkerCommand::Scan(request),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodAvailability {
    pub method: DiscoveryMethod,
    pub requires_privilege: bool,
    pub available: bool,
}

/// Worker replies to the `check` and `methods` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Check {
        privileged: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Methods {
        methods: Vec<MethodAvailability>,
    },
}

/// Completion signal delivered once per operation after its stream ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub ok: bool,
    pub error_message: Option<String>,
}

impl Completion {
    #[inline]
    #[must_use]
    pub fn success() -> Self {
        Self {
            ok: true,
            error_message: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn failure<S: Into<String>>(message: S) -> Self {
        Self {
            ok: false,
            error_message: Some(message.into()),
        }
    }

    #[inline]
    #[must_use]
    pub fn cancelled() -> Self {
        Self::failure("cancelled")
    }
}

/// OS-level privilege registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeState {
    NotRegistered,
    RequiresApproval,
    Granted,
    NotFound,
}

impl PrivilegeState {
    #[inline]
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, PrivilegeState::Granted)
    }
}

impl fmt::Display for PrivilegeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrivilegeState::NotRegistered => "not registered",
            PrivilegeState::RequiresApproval => "requires approval",
            PrivilegeState::Granted => "granted",
            PrivilegeState::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// Privilege state plus an optional explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegeReport {
    pub state: PrivilegeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PrivilegeReport {
    #[inline]
    #[must_use]
    pub fn new(state: PrivilegeState) -> Self {
        Self { state, reason: None }
    }

    #[inline]
    #[must_use]
    pub fn granted() -> Self {
        Self::new(PrivilegeState::Granted)
    }

    #[inline]
    #[must_use]
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
