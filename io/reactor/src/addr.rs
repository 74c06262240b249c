//! IPv4 socket addresses.
//!
//! The wire-level address handling in this crate is IPv4-only; host-name
//! resolution takes the first IPv4 result and rejects IPv6-only hosts.

use crate::error::Error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;

/// An IPv4 address/port pair with a canonical `"A.B.C.D:P"` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr {
    addr: SocketAddrV4,
}

impl InetAddr {
    /// Bindable wildcard address (`0.0.0.0:port`).
    pub fn any(port: u16) -> Self {
        InetAddr {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        InetAddr {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    /// Parse the canonical `"A.B.C.D:P"` form.
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse::<SocketAddrV4>()
            .map(|addr| InetAddr { addr })
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }

    /// Resolve a host name to its first IPv4 address.
    pub fn resolve(host: &str, port: u16) -> Result<Self, Error> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(format!("{host}: {e}")))?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Ok(InetAddr { addr: v4 });
            }
        }
        Err(Error::Resolve(format!("no IPv4 address for {host}")))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn to_ip_port(&self) -> String {
        self.addr.to_string()
    }

    pub(crate) fn to_sockaddr_in(self) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: self.addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(self.addr.ip().octets()),
            },
            sin_zero: [0; 8],
        }
    }

    pub(crate) fn from_sockaddr_in(sa: &libc::sockaddr_in) -> Self {
        InetAddr {
            addr: SocketAddrV4::new(
                Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sa.sin_port),
            ),
        }
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl From<SocketAddrV4> for InetAddr {
    fn from(addr: SocketAddrV4) -> Self {
        InetAddr { addr }
    }
}

impl FromStr for InetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InetAddr::parse(s)
    }
}
