//! Address Model
//!
//! Host and endpoint addresses as plain values. The wire encoding tags the
//! family explicitly so it does not depend on platform `sockaddr` numbering.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use local_ip_address::list_afinet_netifas;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;
use thiserror::Error;

/// Wire family tags
const TAG_NONE: u8 = 0;
const TAG_IPV4: u8 = 1;
const TAG_IPV6: u8 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Invalid host address: {0}")]
    InvalidHost(String),
    #[error("Invalid port in address: {0}")]
    InvalidPort(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressWireError {
    #[error("Address data incomplete")]
    Incomplete,
    #[error("Invalid address family tag: {0}")]
    InvalidFamily(u8),
}

/// A host address without port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostAddress {
    #[default]
    Unknown,
    V4(Ipv4Addr),
    V6 { addr: Ipv6Addr, scope_id: u32 },
}

impl HostAddress {
    pub const LOOPBACK: HostAddress = HostAddress::V6 {
        addr: Ipv6Addr::LOCALHOST,
        scope_id: 0,
    };
    pub const ANY: HostAddress = HostAddress::V6 {
        addr: Ipv6Addr::UNSPECIFIED,
        scope_id: 0,
    };
    pub const ANY_V4: HostAddress = HostAddress::V4(Ipv4Addr::UNSPECIFIED);

    pub fn v6(addr: Ipv6Addr) -> Self {
        HostAddress::V6 { addr, scope_id: 0 }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match *self {
            HostAddress::Unknown => None,
            HostAddress::V4(v4) => Some(IpAddr::V4(v4)),
            HostAddress::V6 { addr, .. } => Some(IpAddr::V6(addr)),
        }
    }

    pub fn scope_id(&self) -> u32 {
        match *self {
            HostAddress::V6 { scope_id, .. } => scope_id,
            _ => 0,
        }
    }

    /// True for an unknown family or the unspecified address.
    pub fn is_null(&self) -> bool {
        match self {
            HostAddress::Unknown => true,
            HostAddress::V4(v4) => v4.is_unspecified(),
            HostAddress::V6 { addr, .. } => addr.is_unspecified(),
        }
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        matches!(self, HostAddress::V6 { addr, .. } if addr.to_ipv4_mapped().is_some())
    }

    pub fn is_loopback(&self) -> bool {
        match self.as_ipv4() {
            HostAddress::V4(v4) => v4.is_loopback(),
            HostAddress::V6 { addr, .. } => addr.is_loopback(),
            HostAddress::Unknown => false,
        }
    }

    /// Link-local: fe80::/10 or 169.254.0.0/16.
    pub fn is_local(&self) -> bool {
        match self.as_ipv4() {
            HostAddress::V4(v4) => v4.is_link_local(),
            HostAddress::V6 { addr, .. } => (addr.segments()[0] & 0xffc0) == 0xfe80,
            HostAddress::Unknown => false,
        }
    }

    /// Site-private: fc00::/7 or RFC 1918 ranges.
    pub fn is_private(&self) -> bool {
        match self.as_ipv4() {
            HostAddress::V4(v4) => v4.is_private(),
            HostAddress::V6 { addr, .. } => (addr.segments()[0] & 0xfe00) == 0xfc00,
            HostAddress::Unknown => false,
        }
    }

    pub fn is_multicast(&self) -> bool {
        match self.as_ipv4() {
            HostAddress::V4(v4) => v4.is_multicast(),
            HostAddress::V6 { addr, .. } => addr.is_multicast(),
            HostAddress::Unknown => false,
        }
    }

    /// IPv4 addresses become IPv6-mapped; everything else is returned as is.
    pub fn as_ipv6(&self) -> HostAddress {
        match *self {
            HostAddress::V4(v4) => HostAddress::v6(v4.to_ipv6_mapped()),
            other => other,
        }
    }

    /// IPv6-mapped addresses become plain IPv4; everything else is returned as is.
    pub fn as_ipv4(&self) -> HostAddress {
        match *self {
            HostAddress::V6 { addr, .. } => match addr.to_ipv4_mapped() {
                Some(v4) => HostAddress::V4(v4),
                None => *self,
            },
            other => other,
        }
    }

    fn rank(&self) -> u8 {
        if self.is_local() {
            0
        } else if self.is_private() {
            1
        } else if matches!(self.as_ipv4(), HostAddress::V4(_)) {
            2
        } else if matches!(self, HostAddress::V6 { .. }) {
            3
        } else {
            4
        }
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => HostAddress::V4(v4),
            IpAddr::V6(v6) => HostAddress::v6(v6),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::Unknown => write!(f, "<unknown>"),
            HostAddress::V4(v4) => write!(f, "{}", v4),
            HostAddress::V6 { addr, scope_id: 0 } => write!(f, "{}", addr),
            HostAddress::V6 { addr, scope_id } => write!(f, "{}%{}", addr, scope_id),
        }
    }
}

impl FromStr for HostAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, scope) = match s.split_once('%') {
            Some((ip, scope)) => (ip, Some(scope)),
            None => (s, None),
        };
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| AddressParseError::InvalidHost(s.to_string()))?;
        match (ip, scope) {
            (IpAddr::V6(addr), Some(scope)) => {
                let scope_id = scope
                    .parse()
                    .map_err(|_| AddressParseError::InvalidHost(s.to_string()))?;
                Ok(HostAddress::V6 { addr, scope_id })
            }
            (IpAddr::V4(_), Some(_)) => Err(AddressParseError::InvalidHost(s.to_string())),
            (ip, None) => Ok(ip.into()),
        }
    }
}

/// A host address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EndpointAddress {
    pub host: HostAddress,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: HostAddress, port: u16) -> Self {
        EndpointAddress { host, port }
    }

    pub fn is_null(&self) -> bool {
        self.host.is_null() && self.port == 0
    }

    /// Sets the port only if none is set yet.
    pub fn with_default_port(mut self, port: u16) -> Self {
        if self.port == 0 {
            self.port = port;
        }
        self
    }

    pub fn as_ipv6(&self) -> EndpointAddress {
        EndpointAddress::new(self.host.as_ipv6(), self.port)
    }

    /// Form used for equality across the transports: IPv6-mapped IPv4 is unmapped.
    pub fn canonical(&self) -> EndpointAddress {
        EndpointAddress::new(self.host.as_ipv4(), self.port)
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            HostAddress::Unknown => None,
            HostAddress::V4(v4) => Some(SocketAddr::from((v4, self.port))),
            HostAddress::V6 { addr, scope_id } => Some(SocketAddr::V6(SocketAddrV6::new(
                addr, self.port, 0, scope_id,
            ))),
        }
    }

    /// Appends the tagged wire form: family tag, address bytes, port (LE).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self.host {
            HostAddress::Unknown => buf.put_u8(TAG_NONE),
            HostAddress::V4(v4) => {
                buf.put_u8(TAG_IPV4);
                buf.put_slice(&v4.octets());
            }
            HostAddress::V6 { addr, .. } => {
                buf.put_u8(TAG_IPV6);
                buf.put_slice(&addr.octets());
            }
        }
        buf.put_u16_le(self.port);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, AddressWireError> {
        if buf.remaining() < 1 {
            return Err(AddressWireError::Incomplete);
        }
        let tag = buf.get_u8();
        let len = match tag {
            TAG_NONE => 0,
            TAG_IPV4 => 4,
            TAG_IPV6 => 16,
            other => return Err(AddressWireError::InvalidFamily(other)),
        };
        if buf.remaining() < len + 2 {
            return Err(AddressWireError::Incomplete);
        }
        let host = match tag {
            TAG_IPV4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                HostAddress::V4(Ipv4Addr::from(octets))
            }
            TAG_IPV6 => {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                HostAddress::v6(Ipv6Addr::from(octets))
            }
            _ => HostAddress::Unknown,
        };
        let port = buf.get_u16_le();
        Ok(EndpointAddress { host, port })
    }
}

impl From<SocketAddr> for EndpointAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => EndpointAddress::new(HostAddress::V4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => EndpointAddress::new(
                HostAddress::V6 {
                    addr: *v6.ip(),
                    scope_id: v6.scope_id(),
                },
                v6.port(),
            ),
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            HostAddress::V6 { .. } => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressParseError;

    /// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| AddressParseError::InvalidPort(s.to_string()))
        };
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::InvalidHost(s.to_string()))?;
            let port = match tail {
                "" => 0,
                t => parse_port(
                    t.strip_prefix(':')
                        .ok_or_else(|| AddressParseError::InvalidPort(s.to_string()))?,
                )?,
            };
            return Ok(EndpointAddress::new(host.parse()?, port));
        }
        // more than one colon without brackets: bare IPv6
        if s.matches(':').count() > 1 {
            return Ok(EndpointAddress::new(s.parse()?, 0));
        }
        match s.split_once(':') {
            Some((host, port)) => Ok(EndpointAddress::new(host.parse()?, parse_port(port)?)),
            None => Ok(EndpointAddress::new(s.parse()?, 0)),
        }
    }
}

/// Orders addresses by preference: link-local, private, IPv4, global IPv6.
/// The sort is stable so equally ranked addresses keep their relative order.
pub fn sort_addresses(addrs: &mut [EndpointAddress]) {
    addrs.sort_by_key(|a| a.host.rank());
}

/// Non-loopback addresses of all local interfaces, best first.
pub fn local_addresses() -> Vec<HostAddress> {
    let mut hosts: Vec<HostAddress> = match list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|(_, ip)| HostAddress::from(ip))
            .filter(|h| !h.is_loopback() && !h.is_null())
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to list local interfaces: {}", e);
            Vec::new()
        }
    };
    hosts.sort_by_key(|h| h.rank());
    hosts.dedup();
    hosts
}
