//! Expands a target specification into an ordered sequence of scan units.
//!
//! Every sequence here is produced lazily: a `/8` sweep or a full port range
//! never materialises its address or port list, units are generated one at
//! a time as the work queue has room for them.
use std::fmt;
use std::iter;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::str::FromStr;

use cidr_utils::cidr::{IpCidr, IpInet};
use either::Either;
use serde_derive::{Deserialize, Serialize};

use crate::error::{InvalidSpec, Result};

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Transport used for a connection attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Full TCP handshake.
    #[default]
    Tcp,
    /// Connected UDP socket; see [`Prober`](crate::scanner::probe::Prober)
    /// for why its answers are unreliable.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// One thing to probe: an address, a port and the transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScanUnit {
    /// Address of the probed host.
    pub host: IpAddr,
    /// Probed port.
    pub port: u16,
    /// Transport of the probe.
    pub protocol: Protocol,
}

impl ScanUnit {
    /// Builds a unit.
    pub const fn new(host: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self {
            host,
            port,
            protocol,
        }
    }

    /// Socket address the probe connects to.
    pub fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.socket(), self.protocol)
    }
}

/// Inclusive port range `[start, end]`.
///
/// A reversed range (`start > end`) is valid and simply empty.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port, inclusive.
    pub start: u16,
    /// Last port, inclusive.
    pub end: u16,
}

impl PortRange {
    /// Builds a range; no ordering is required between `start` and `end`.
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Ports of the range in ascending order.
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Number of ports, `max(0, end - start + 1)`.
    pub const fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Whether the range holds no port at all.
    pub const fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Units for every port of the range on `host`, ascending.
    ///
    /// ```rust
    /// # use sweepscan::target::{PortRange, Protocol};
    /// let host = "127.0.0.1".parse().unwrap();
    /// let ports: Vec<u16> = PortRange::new(20, 22)
    ///     .units(host, Protocol::Tcp)
    ///     .map(|unit| unit.port)
    ///     .collect();
    /// assert_eq!(ports, [20, 21, 22]);
    /// assert_eq!(PortRange::new(5, 1).units(host, Protocol::Tcp).count(), 0);
    /// ```
    pub fn units(self, host: IpAddr, protocol: Protocol) -> impl Iterator<Item = ScanUnit> {
        self.ports()
            .map(move |port| ScanUnit::new(host, port, protocol))
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(LOWEST_PORT_NUMBER, TOP_PORT_NUMBER)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Accepts `start-end` or a single port.
    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let input = input.trim();
        let Some((start, end)) = input.split_once('-') else {
            let port = parse_port(input, input)?;
            return Ok(Self::new(port, port));
        };

        if end.contains('-') {
            return Err(format!(
                "Invalid range format '{input}'. Expected 'start-end'. Example: 1-1000.",
            ));
        }

        Ok(Self::new(parse_port(start, input)?, parse_port(end, input)?))
    }
}

fn parse_port(port: &str, range: &str) -> std::result::Result<u16, String> {
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| format!("Invalid port number '{port}' in '{range}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

/// A contiguous address block in CIDR notation.
///
/// Host bits in the input are masked off, so `10.0.0.5/30` is the block
/// `10.0.0.0/30`. A bare address is a single-host block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrBlock(IpCidr);

impl CidrBlock {
    /// Parses CIDR notation, failing with [`InvalidSpec::Cidr`].
    ///
    /// ```rust
    /// # use sweepscan::target::CidrBlock;
    /// let block = CidrBlock::parse("192.168.0.0/30").unwrap();
    /// assert_eq!(block.len(), 4);
    /// assert!(CidrBlock::parse("192.168.0.0/33").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let parsed = if trimmed.contains('/') {
            IpInet::from_str(trimmed)
                .map(|inet| inet.network())
                .map_err(|e| e.to_string())
        } else {
            IpAddr::from_str(trimmed)
                .map(IpCidr::new_host)
                .map_err(|e| e.to_string())
        };

        parsed.map(Self).map_err(|reason| InvalidSpec::Cidr {
            input: input.to_owned(),
            reason,
        })
    }

    /// Block holding exactly `host`.
    pub fn host(host: IpAddr) -> Self {
        Self(IpCidr::new_host(host))
    }

    /// Network (lowest) address of the block.
    pub fn network(&self) -> IpAddr {
        self.0.first_address()
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.0.network_length()
    }

    /// Number of addresses in the block, network and broadcast included.
    ///
    /// Saturates at `u128::MAX` for `::/0`.
    pub fn len(&self) -> u128 {
        let width: u8 = match self.0 {
            IpCidr::V4(_) => 32,
            IpCidr::V6(_) => 128,
        };
        1u128
            .checked_shl(u32::from(width - self.prefix_len()))
            .unwrap_or(u128::MAX)
    }

    /// A block always holds at least its network address.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `addr` falls inside the block.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.contains(addr)
    }

    /// Every address of the block in ascending numeric order.
    pub fn addresses(self) -> impl Iterator<Item = IpAddr> {
        self.0.iter().map(|inet| inet.address())
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CidrBlock {
    type Err = InvalidSpec;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

impl serde::Serialize for CidrBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a job points at: one host or a whole block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Target {
    /// A single address.
    Host(IpAddr),
    /// Every address of a CIDR block.
    Network(CidrBlock),
}

impl Target {
    /// Addresses covered by the target, ascending.
    pub fn addresses(self) -> impl Iterator<Item = IpAddr> {
        match self {
            Self::Host(ip) => Either::Left(iter::once(ip)),
            Self::Network(block) => Either::Right(block.addresses()),
        }
    }

    /// Units for every port of `ports` on every address, address-major.
    pub fn units(self, ports: PortRange, protocol: Protocol) -> impl Iterator<Item = ScanUnit> {
        self.addresses()
            .flat_map(move |host| ports.units(host, protocol))
    }

    /// Number of units [`Target::units`] yields, saturating.
    pub fn unit_count(self, ports: PortRange) -> u128 {
        let hosts = match self {
            Self::Host(_) => 1,
            Self::Network(block) => block.len(),
        };
        hosts.saturating_mul(ports.len() as u128)
    }

    /// The target as a block; a host becomes a single-host block.
    pub fn block(self) -> CidrBlock {
        match self {
            Self::Host(ip) => CidrBlock::host(ip),
            Self::Network(block) => block,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(ip) => write!(f, "{ip}"),
            Self::Network(block) => write!(f, "{block}"),
        }
    }
}

impl FromStr for Target {
    type Err = InvalidSpec;

    /// Parses an address or a CIDR block. Host names are not resolved here,
    /// see [`resolve_target`](crate::address::resolve_target).
    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.contains('/') {
            return CidrBlock::parse(trimmed).map(Self::Network);
        }
        IpAddr::from_str(trimmed)
            .map(Self::Host)
            .map_err(|_| InvalidSpec::UnresolvableHost(input.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::{CidrBlock, PortRange, Protocol, Target};
    use crate::error::InvalidSpec;
    use parameterized::parameterized;
    use std::net::{IpAddr, Ipv4Addr};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[parameterized(start = {1, 1, 1000, 65_535, 1}, end = {1, 1000, 1010, 65_535, 65_535})]
    fn port_range_yields_each_port_once_ascending(start: u16, end: u16) {
        let ports: Vec<u16> = PortRange::new(start, end)
            .units(LOCALHOST, Protocol::Tcp)
            .map(|unit| unit.port)
            .collect();

        assert_eq!(ports.len(), usize::from(end - start) + 1);
        assert_eq!(ports.first(), Some(&start));
        assert_eq!(ports.last(), Some(&end));
        assert!(ports.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn single_port_range_yields_one_unit() {
        let units: Vec<_> = PortRange::new(1, 1).units(LOCALHOST, Protocol::Udp).collect();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].port, 1);
        assert_eq!(units[0].protocol, Protocol::Udp);
    }

    #[test]
    fn reversed_port_range_is_empty() {
        let range = PortRange::new(5, 1);
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);
        assert_eq!(range.units(LOCALHOST, Protocol::Tcp).count(), 0);
    }

    #[test]
    fn parse_port_ranges() {
        assert_eq!("1-1000".parse(), Ok(PortRange::new(1, 1000)));
        assert_eq!(" 80 ".parse(), Ok(PortRange::new(80, 80)));
        assert_eq!("5-1".parse(), Ok(PortRange::new(5, 1)));
        assert!("1-2-3".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
        assert!("1-70000"
            .parse::<PortRange>()
            .unwrap_err()
            .contains("Invalid port number '70000'"));
    }

    #[parameterized(prefix = {32, 31, 30, 24, 20, 16})]
    fn ipv4_block_enumerates_every_address(prefix: u8) {
        let block = CidrBlock::parse(&format!("172.16.0.0/{prefix}")).unwrap();
        let expected = 1u128 << (32 - prefix);

        assert_eq!(block.len(), expected);
        assert_eq!(block.addresses().count() as u128, expected);
    }

    #[test]
    fn block_includes_network_and_broadcast_in_order() {
        let addrs: Vec<IpAddr> = CidrBlock::parse("192.168.0.0/30").unwrap().addresses().collect();
        assert_eq!(
            addrs,
            [
                Ipv4Addr::new(192, 168, 0, 0),
                Ipv4Addr::new(192, 168, 0, 1),
                Ipv4Addr::new(192, 168, 0, 2),
                Ipv4Addr::new(192, 168, 0, 3),
            ]
        );
    }

    #[test]
    fn host_bits_are_masked() {
        let block = CidrBlock::parse("10.0.0.5/30").unwrap();
        assert_eq!(block.network(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(block.prefix_len(), 30);
        assert!(block.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))));
        assert!(!block.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4))));
    }

    #[test]
    fn large_blocks_are_streamed() {
        let block = CidrBlock::parse("0.0.0.0/0").unwrap();
        assert_eq!(block.len(), 1 << 32);
        let first: Vec<IpAddr> = block.addresses().take(2).collect();
        assert_eq!(first, [Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(0, 0, 0, 1)]);
        assert_eq!(CidrBlock::parse("::/0").unwrap().len(), u128::MAX);
    }

    #[parameterized(input = {"10.0.0.0/33", "10.0.0/24", "not-a-block", "10.0.0.0/", ""})]
    fn malformed_blocks_are_rejected(input: &str) {
        assert!(matches!(CidrBlock::parse(input), Err(InvalidSpec::Cidr { .. })));
    }

    #[test]
    fn network_target_is_address_major() {
        let target: Target = "10.1.0.0/31".parse().unwrap();
        let units: Vec<(IpAddr, u16)> = target
            .units(PortRange::new(22, 23), Protocol::Tcp)
            .map(|unit| (unit.host, unit.port))
            .collect();
        let first = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0));
        let second = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1));

        assert_eq!(units, [(first, 22), (first, 23), (second, 22), (second, 23)]);
        assert_eq!(target.unit_count(PortRange::new(22, 23)), 4);
    }

    #[test]
    fn host_names_are_not_targets_without_resolution() {
        assert_eq!(
            "localhost".parse::<Target>(),
            Err(InvalidSpec::UnresolvableHost("localhost".to_owned()))
        );
        assert_eq!("::1".parse::<Target>(), Ok(Target::Host("::1".parse().unwrap())));
    }
}
