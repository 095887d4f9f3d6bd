use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub const UNSPECIFIED: Self = Address::Ipv4(Ipv4Addr::UNSPECIFIED);

    pub fn from(s: &str) -> std::io::Result<Self> {
        if s.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty address",
            ));
        }

        let trimmed = s
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .unwrap_or(s);

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip));
        }

        if !is_valid_hostname(s) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse address: {s}"),
            ));
        }

        Ok(Address::Hostname(s.to_string()))
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => Address::Ipv4(addr),
            // IPv4-mapped addresses are unmapped so rule matching sees a single family.
            IpAddr::V6(addr) => match addr.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4),
                None => Address::Ipv6(addr),
            },
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn is_ip(&self) -> bool {
        !self.is_fqdn()
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }
}

fn is_valid_hostname(s: &str) -> bool {
    let name = s.strip_suffix('.').unwrap_or(s);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Address::Ipv4(i) => write!(f, "{i}"),
            Address::Ipv6(i) => write!(f, "{i}"),
            Address::Hostname(h) => write!(f, "{h}"),
        }
    }
}

/// A destination or source: an IP or a domain name, plus a port.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub const UNSPECIFIED: Self = NetLocation::new(Address::UNSPECIFIED, 0);

    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_ip_addr(ip: IpAddr, port: u16) -> Self {
        Self {
            address: Address::from_ip(ip),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip_addr(addr.ip(), addr.port())
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let (address_str, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid location: {s}"),
                )
            })?;
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => Some(parse_port(p)?),
                None => default_port,
            };
            (&rest[..end], port)
        } else {
            match s.rfind(':') {
                Some(i) if s[..i].contains(':') => (s, default_port),
                Some(i) => (&s[..i], Some(parse_port(&s[i + 1..])?)),
                None => (s, default_port),
            }
        };

        let address = Address::from(address_str)?;
        let port = port.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("No port in location: {s}"),
            )
        })?;

        Ok(Self { address, port })
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn unwrap_components(self) -> (Address, u16) {
        (self.address, self.port)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ip(&self) -> bool {
        self.address.is_ip()
    }

    pub fn is_fqdn(&self) -> bool {
        self.address.is_fqdn()
    }

    pub fn is_valid(&self) -> bool {
        match &self.address {
            Address::Hostname(h) => !h.is_empty(),
            _ => true,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self == &Self::UNSPECIFIED
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Number of bytes this location occupies in SOCKS address form.
    pub fn serialized_len(&self) -> usize {
        let address_len = match &self.address {
            Address::Ipv4(_) => 4,
            Address::Ipv6(_) => 16,
            Address::Hostname(h) => 1 + h.len(),
        };
        1 + address_len + 2
    }
}

fn parse_port(s: &str) -> std::io::Result<u16> {
    s.parse::<u16>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid port {s}: {e}"),
        )
    })
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

impl From<SocketAddr> for NetLocation {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl Serialize for NetLocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        NetLocation::from_str(&value, None).map_err(serde::de::Error::custom)
    }
}

/// Writes `location` in SOCKS address form: type byte, address, big-endian port.
pub fn write_socks_addr<B: BufMut>(location: &NetLocation, buf: &mut B) {
    match location.address() {
        Address::Ipv4(v4) => {
            buf.put_u8(ADDR_TYPE_IPV4);
            buf.put_slice(&v4.octets());
        }
        Address::Ipv6(v6) => {
            buf.put_u8(ADDR_TYPE_IPV6);
            buf.put_slice(&v6.octets());
        }
        Address::Hostname(host) => {
            let host = host.as_bytes();
            // Address::from rejects names over 253 bytes.
            let len = host.len().min(255);
            buf.put_u8(ADDR_TYPE_DOMAIN_NAME);
            buf.put_u8(len as u8);
            buf.put_slice(&host[..len]);
        }
    }
    buf.put_u16(location.port());
}

pub fn socks_addr_to_vec(location: &NetLocation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(location.serialized_len());
    write_socks_addr(location, &mut buf);
    buf
}

/// Parses a SOCKS address from the start of `data`, returning the location and the number of
/// bytes consumed. `Ok(None)` means `data` is too short.
pub fn parse_socks_addr(data: &[u8]) -> std::io::Result<Option<(NetLocation, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    let (address, offset) = match data[0] {
        ADDR_TYPE_IPV4 => {
            if data.len() < 1 + 4 + 2 {
                return Ok(None);
            }
            let octets: [u8; 4] = [data[1], data[2], data[3], data[4]];
            (Address::Ipv4(Ipv4Addr::from(octets)), 5)
        }
        ADDR_TYPE_IPV6 => {
            if data.len() < 1 + 16 + 2 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            (Address::from_ip(IpAddr::V6(Ipv6Addr::from(octets))), 17)
        }
        ADDR_TYPE_DOMAIN_NAME => {
            if data.len() < 2 {
                return Ok(None);
            }
            let len = data[1] as usize;
            if data.len() < 2 + len + 2 {
                return Ok(None);
            }
            let host = std::str::from_utf8(&data[2..2 + len]).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid domain name: {e}"),
                )
            })?;
            (hostname_or_ip(host)?, 2 + len)
        }
        unknown => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown address type: {unknown}"),
            ));
        }
    };
    let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    Ok(Some((NetLocation::new(address, port), offset + 2)))
}

/// Reads a SOCKS address from an async stream.
pub async fn read_socks_addr<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<NetLocation> {
    let address_type = reader.read_u8().await?;
    let address = match address_type {
        ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Address::from_ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            let len = reader.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            reader.read_exact(&mut host).await?;
            let host = String::from_utf8(host).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid domain name: {e}"),
                )
            })?;
            hostname_or_ip(&host)?
        }
        unknown => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown address type: {unknown}"),
            ));
        }
    };
    let port = reader.read_u16().await?;
    Ok(NetLocation::new(address, port))
}

// Some clients send literal IPs in the domain form.
fn hostname_or_ip(host: &str) -> std::io::Result<Address> {
    if host.is_empty() {
        return Ok(Address::Hostname(String::new()));
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(Address::from_ip(ip)),
        Err(_) => Address::from(host),
    }
}

/// An IP network used by CIDR rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    address: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let (address_str, prefix) = match s.rfind('/') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let address = address_str.parse::<IpAddr>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Failed to parse cidr address {address_str}: {e}"),
            )
        })?;
        let max_len = if address.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Failed to parse netmask: {e}"),
                )
            })?,
            None => max_len,
        };
        if prefix_len > max_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid prefix length for {address}: {prefix_len}"),
            ));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => *ip,
            },
            _ => *ip,
        };
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn prefix_mask_u128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

impl std::fmt::Display for IpCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}
