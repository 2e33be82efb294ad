//! IPv4 address value type for listeners and connections.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 socket address.
///
/// Thin value wrapper over [`SocketAddrV4`] with the string accessors the
/// library surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress {
    addr: SocketAddrV4,
}

impl InetAddress {
    /// Address from an explicit IP and port.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: SocketAddrV4::new(ip, port),
        }
    }

    /// Loopback address on the given port.
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Wildcard address on the given port.
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Dotted-quad IP string.
    pub fn to_ip(&self) -> String {
        self.addr.ip().to_string()
    }

    /// `ip:port` string.
    pub fn to_ip_port(&self) -> String {
        self.addr.to_string()
    }

    /// The port number.
    #[inline]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }
}

impl From<SocketAddrV4> for InetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self { addr }
    }
}

impl TryFrom<SocketAddr> for InetAddress {
    type Error = std::io::Error;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self { addr: v4 }),
            SocketAddr::V6(_) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "IPv6 addresses are not supported",
            )),
        }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let addr = InetAddress::new(Ipv4Addr::new(10, 0, 0, 7), 8000);
        assert_eq!(addr.to_ip(), "10.0.0.7");
        assert_eq!(addr.to_ip_port(), "10.0.0.7:8000");
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn loopback_default_ip() {
        let addr = InetAddress::loopback(9999);
        assert_eq!(addr.to_ip(), "127.0.0.1");
    }

    #[test]
    fn rejects_ipv6() {
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(InetAddress::try_from(v6).is_err());
    }
}
