//! Host and socket address model.
//!
//! Addresses are stored in network byte order. The text forms are
//! `a.b.c.d` for IPv4 and `[x:y::z]` for IPv6; brackets are mandatory so
//! that the port separator of a socket address stays unambiguous.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::NetError;

bitflags! {
    /// Address family mask: any combination of IPv4 and IPv6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetworkType: u8 {
        const INET = 1;
        const INET6 = 2;
    }
}

/// A host address, IPv4 or IPv6, in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl HostAddress {
    /// The family this address belongs to, as a one-bit mask.
    pub fn network_type(&self) -> NetworkType {
        match self {
            HostAddress::V4(_) => NetworkType::INET,
            HostAddress::V6(_) => NetworkType::INET6,
        }
    }

    pub fn to_ip_addr(&self) -> IpAddr {
        match self {
            HostAddress::V4(octets) => IpAddr::V4(Ipv4Addr::from(*octets)),
            HostAddress::V6(octets) => IpAddr::V6(Ipv6Addr::from(*octets)),
        }
    }
}

impl From<IpAddr> for HostAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => HostAddress::V4(v4.octets()),
            IpAddr::V6(v6) => HostAddress::V6(v6.octets()),
        }
    }
}

impl FromStr for HostAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, NetError> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| NetError::Parse(format!("invalid address {s:?}")))?;
            let ip: Ipv6Addr = inner
                .parse()
                .map_err(|_| NetError::Parse(format!("invalid address {s:?}")))?;
            Ok(HostAddress::V6(ip.octets()))
        } else {
            let ip: Ipv4Addr = s
                .parse()
                .map_err(|_| NetError::Parse(format!("invalid address {s:?}")))?;
            Ok(HostAddress::V4(ip.octets()))
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::V4(o) => write!(f, "{}.{}.{}.{}", o[0], o[1], o[2], o[3]),
            HostAddress::V6(o) => fmt_v6(o, f),
        }
    }
}

/// Formats an IPv6 address bracketed, lowercase hex, with the longest run
/// of zero groups collapsed to `::` (first run wins on ties). A run of
/// length one is collapsed too.
fn fmt_v6(octets: &[u8; 16], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let groups: [u16; 8] =
        std::array::from_fn(|i| u16::from_be_bytes([octets[2 * i], octets[2 * i + 1]]));

    let mut best: Option<(usize, usize)> = None;
    let mut run: Option<(usize, usize)> = None;
    for (i, &g) in groups.iter().enumerate() {
        if g != 0 {
            run = None;
            continue;
        }
        let (pos, len) = match run {
            Some((pos, len)) => (pos, len + 1),
            None => (i, 1),
        };
        run = Some((pos, len));
        if best.map_or(true, |(_, blen)| blen < len) {
            best = Some((pos, len));
        }
    }

    write!(f, "[")?;
    let mut i = 0;
    let mut need_colon = false;
    while i < 8 {
        match best {
            Some((pos, len)) if pos == i => {
                write!(f, "::")?;
                need_colon = false;
                i += len;
            }
            _ => {
                if need_colon {
                    write!(f, ":")?;
                }
                write!(f, "{:x}", groups[i])?;
                need_colon = true;
                i += 1;
            }
        }
    }
    write!(f, "]")
}

/// A host address plus TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    pub host: HostAddress,
    pub port: u16,
}

impl SocketAddress {
    pub fn new(host: HostAddress, port: u16) -> Self {
        Self { host, port }
    }

    pub fn network_type(&self) -> NetworkType {
        self.host.network_type()
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().into(),
            port: addr.port(),
        }
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> Self {
        SocketAddr::new(addr.host.to_ip_addr(), addr.port)
    }
}

impl FromStr for SocketAddress {
    type Err = NetError;

    /// Splits on the rightmost `:` so bracketed IPv6 parses correctly.
    /// The port must consume the whole right side.
    fn from_str(s: &str) -> Result<Self, NetError> {
        let (host_str, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| NetError::Parse(format!("missing port in {s:?}")))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetError::Parse(format!("invalid port in {s:?}")))?;
        Ok(SocketAddress {
            host: host_str.parse()?,
            port,
        })
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses an outbound interface spec `ADDR[@METRIC]`.
///
/// The metric defaults to 1 when absent; a trailing `@N` must be a decimal
/// integer consuming the whole suffix.
pub fn parse_iface_spec(s: &str) -> Result<(HostAddress, Option<u16>), NetError> {
    match s.rsplit_once('@') {
        Some((addr, metric)) => {
            let metric: u16 = metric
                .parse()
                .map_err(|_| NetError::Parse(format!("invalid metric in {s:?}")))?;
            Ok((addr.parse()?, Some(metric)))
        }
        None => Ok((s.parse()?, None)),
    }
}
