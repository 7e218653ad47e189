use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Network endpoint address.
///
/// Holds both families in one value; for IPv4 only the first 4 bytes of
/// `ip` are meaningful. `port` is kept in network byte order, matching
/// what goes on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Addr {
    pub ip: [u8; 16],
    /// Network byte order.
    pub port: u16,
    pub is_ip6: bool,
    pub scope_id: u8,
}

impl Addr {
    pub fn new4(ip: [u8; 4], host_port: u16) -> Self {
        let mut a = Self { port: host_port.to_be(), ..Self::default() };
        a.ip[..4].copy_from_slice(&ip);
        a
    }

    /// Port in host byte order.
    #[inline]
    pub const fn host_port(&self) -> u16 {
        u16::from_be(self.port)
    }

    #[inline]
    pub fn set_host_port(&mut self, port: u16) {
        self.port = port.to_be();
    }

    #[inline]
    pub fn ip4(&self) -> [u8; 4] {
        [self.ip[0], self.ip[1], self.ip[2], self.ip[3]]
    }

    pub fn is_unspecified(&self) -> bool {
        if self.is_ip6 { self.ip == [0; 16] } else { self.ip4() == [0; 4] }
    }

    /// Parses a literal IP address, returning `None` for hostnames.
    pub fn parse_literal(host: &str, host_port: u16) -> Option<Self> {
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        match host.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => Some(Self::new4(v4.octets(), host_port)),
            IpAddr::V6(v6) => {
                let mut a = Self { port: host_port.to_be(), is_ip6: true, ..Self::default() };
                a.ip = v6.octets();
                Some(a)
            }
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        let ip = if self.is_ip6 {
            IpAddr::V6(Ipv6Addr::from(self.ip))
        } else {
            IpAddr::V4(Ipv4Addr::from(self.ip4()))
        };
        SocketAddr::new(ip, self.host_port())
    }

    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        let mut a = Self { port: sa.port().to_be(), ..Self::default() };
        match sa.ip() {
            IpAddr::V4(v4) => a.ip[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => {
                a.ip = v6.octets();
                a.is_ip6 = true;
            }
        }
        a
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        Self::from_socket_addr(sa)
    }
}
