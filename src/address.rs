use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::net::lookup_host;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Address::Ip(ip));
        }

        if s.is_empty()
            || !s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse address: {}", s),
            ));
        }

        Ok(Address::Hostname(s.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => ip.fmt(f),
            Address::Hostname(hostname) => f.write_str(hostname),
        }
    }
}

/// An address/port pair as it appears in configuration. Hostnames resolve
/// lazily, once per connection attempt.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        // Allow '[v6]:port', a bare v6 literal, 'host:port', and bare hosts.
        if let Some(stripped) = s.strip_prefix('[') {
            let (address_str, rest) = stripped.split_once(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Unbalanced bracket in address: {}", s),
                )
            })?;
            let port = match rest.strip_prefix(':') {
                Some(port_str) => Some(parse_port(port_str)?),
                None => default_port,
            };
            return Self::build(address_str, port);
        }

        if s.parse::<IpAddr>().is_ok() {
            // A bare v6 literal contains colons that are not a port separator.
            return Self::build(s, default_port);
        }

        match s.rsplit_once(':') {
            Some((address_str, port_str)) => Self::build(address_str, Some(parse_port(port_str)?)),
            None => Self::build(s, default_port),
        }
    }

    fn build(address_str: &str, port: Option<u16>) -> std::io::Result<Self> {
        let port = port.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Missing port in address: {}", address_str),
            )
        })?;
        Ok(Self {
            address: Address::from(address_str)?,
            port,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves to a single socket address, preferring the first non-wildcard
    /// answer for hostnames.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self.address {
            Address::Ip(ip) => Ok(SocketAddr::new(ip, self.port)),
            Address::Hostname(ref hostname) => {
                lookup_host((hostname.as_str(), self.port))
                    .await?
                    .find(|addr| !addr.ip().is_unspecified())
                    .ok_or_else(|| {
                        std::io::Error::other(format!("Could not resolve {}", hostname))
                    })
            }
        }
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

fn parse_port(s: &str) -> std::io::Result<u16> {
    s.parse::<u16>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse port {}: {}", s, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_ipv4() {
        let loc = NetLocation::from_str("127.0.0.1:51820", None).unwrap();
        assert_eq!(
            loc.address(),
            &Address::Ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
        );
        assert_eq!(loc.port(), 51820);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let loc = NetLocation::from_str("[::1]:7000", None).unwrap();
        assert_eq!(loc.to_string(), "[::1]:7000");
    }

    #[test]
    fn test_parse_bare_ipv6_uses_default_port() {
        let loc = NetLocation::from_str("::1", Some(443)).unwrap();
        assert_eq!(loc.port(), 443);
    }

    #[test]
    fn test_parse_hostname() {
        let loc = NetLocation::from_str("relay.example.com:12345", None).unwrap();
        assert_eq!(
            loc.address(),
            &Address::Hostname("relay.example.com".to_string())
        );
        assert_eq!(loc.port(), 12345);
    }

    #[test]
    fn test_missing_port_is_an_error() {
        assert!(NetLocation::from_str("127.0.0.1", None).is_err());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(NetLocation::from_str("not a host:80", None).is_err());
        assert!(NetLocation::from_str("host:notaport", None).is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_is_immediate() {
        let loc = NetLocation::from_str("127.0.0.1:51820", None).unwrap();
        let addr = loc.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:51820".parse().unwrap());
    }
}
