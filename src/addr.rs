//! Endpoint address types.
//!
//! An endpoint is named by an IP, an IP and port, or an IP and a 16-bit
//! identifier. IPv4 addresses format bare, IPv6 addresses bracketed, so a
//! formatted address parses back to the same value.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Address parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The bracket/colon structure is wrong.
    #[error("invalid address {0}")]
    Malformed(String),
    /// The IP portion does not parse.
    #[error("invalid ip {0}")]
    BadIp(String),
    /// The port is not a 16-bit unsigned integer.
    #[error("invalid port {0}")]
    BadPort(String),
}

/// Formats an IP the way addresses print on this transport: IPv4 bare,
/// IPv6 bracketed.
pub fn format_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// A network endpoint with an IP and a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", format_ip(&self.ip), self.port)
    }
}

impl FromStr for IpPort {
    type Err = AddrError;

    /// Accepts `a.b.c.d:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_str, port_str) = if let Some(rest) = s.strip_prefix('[') {
            rest.split_once("]:")
                .ok_or_else(|| AddrError::Malformed(s.to_string()))?
        } else {
            match s.split_once(':') {
                Some((ip, port)) if !port.contains(':') => (ip, port),
                _ => return Err(AddrError::Malformed(s.to_string())),
            }
        };
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| AddrError::BadIp(ip_str.to_string()))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddrError::BadPort(port_str.to_string()))?;
        Ok(Self { ip, port })
    }
}

/// A network endpoint with an IP and a 16-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpId {
    pub ip: IpAddr,
    pub id: u16,
}

impl IpId {
    pub fn new(ip: IpAddr, id: u16) -> Self {
        Self { ip, id }
    }
}

impl fmt::Display for IpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", format_ip(&self.ip), self.id)
    }
}

/// A data-path address tagged with the transport flavour it was observed or
/// targeted as.
///
/// `Tcp` and `Udp` carry the same [`IpPort`] and format identically. Reads
/// hand back `Udp`-shaped addresses even for frames that wore TCP on the
/// wire, so the reliable-datagram layer above treats this transport as a
/// packet socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    Ip(IpAddr),
    Tcp(IpPort),
    Udp(IpPort),
    Id(IpId),
}

impl Addr {
    /// Name of the flavour, in the style of socket address families.
    pub fn network(&self) -> &'static str {
        match self {
            Addr::Ip(_) => "ip",
            Addr::Tcp(_) => "tcp",
            Addr::Udp(_) => "udp",
            Addr::Id(_) => "ip+id",
        }
    }

    /// The IP of the endpoint, whatever the flavour.
    pub fn ip(&self) -> IpAddr {
        match self {
            Addr::Ip(ip) => *ip,
            Addr::Tcp(ipp) | Addr::Udp(ipp) => ipp.ip,
            Addr::Id(ipid) => ipid.ip,
        }
    }

    /// The IP and port for flavours that carry one.
    pub fn ip_port(&self) -> Option<IpPort> {
        match self {
            Addr::Tcp(ipp) | Addr::Udp(ipp) => Some(*ipp),
            _ => None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ip(ip) => f.write_str(&format_ip(ip)),
            Addr::Tcp(ipp) | Addr::Udp(ipp) => ipp.fmt(f),
            Addr::Id(ipid) => ipid.fmt(f),
        }
    }
}
