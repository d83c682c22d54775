//! The address types used to reach proxies and name servers.

use failure::Fail;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use std::{
    convert::TryFrom,
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    str::FromStr,
    vec,
};

/// The maximum number of bytes in a SOCKS5 variable-length field
/// (domain name, username, password).
pub(crate) const MAX_FIELD_SIZE: usize = 255;

/// An error that occurs when a host cannot be parsed.
///
/// The error contains a message detailling the source of the error.
#[derive(Debug, Fail)]
#[fail(display = "cannot parse host : {}", msg)]
pub struct HostParseError {
    msg: &'static str,
}

impl HostParseError {
    fn new(msg: &'static str) -> Self {
        Self { msg }
    }

    pub fn msg(&self) -> &'static str {
        self.msg
    }
}

macro_rules! serde_display_tryfrom {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                TryFrom::try_from(s).map_err(de::Error::custom)
            }
        }
    };
}

macro_rules! tryfrom_fromstr {
    ($name:ident) => {
        impl TryFrom<String> for $name {
            type Error = HostParseError;
            fn try_from(s: String) -> Result<Self, HostParseError> {
                Self::from_str(s.as_str())
            }
        }

        impl<'a> TryFrom<&'a String> for $name {
            type Error = HostParseError;
            fn try_from(s: &'a String) -> Result<Self, HostParseError> {
                Self::from_str(s.as_str())
            }
        }

        impl<'a> TryFrom<&'a str> for $name {
            type Error = HostParseError;
            fn try_from(s: &'a str) -> Result<Self, HostParseError> {
                Self::from_str(s)
            }
        }
    };
}

/// A host that is either an IP address or a domain name.
///
/// This is the address vocabulary of the SOCKS5 wire format: requests and
/// UDP datagrams carry their destination as an IPv4 address, an IPv6
/// address, or a length-prefixed domain name (ATYP 1, 4 and 3
/// respectively).
///
/// # Example
/// ```
/// use asyncdns::Host;
/// use std::net::Ipv4Addr;
///
/// let ip: Host = "127.0.0.1".parse()?;
/// assert_eq!(Host::Ipv4(Ipv4Addr::LOCALHOST), ip);
///
/// let domain: Host = "localhost".parse()?;
/// assert_eq!(Host::Domain("localhost".to_owned()), domain);
/// #
/// # Ok::<(), asyncdns::HostParseError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// An IPv4 address.
    Ipv4(Ipv4Addr),
    /// An IPv6 address.
    Ipv6(Ipv6Addr),
    /// A domain name of at most 255 bytes, left for the peer to resolve.
    Domain(String),
}

impl Host {
    /// Returns the IP address, if the host is not a domain name.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Host::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        }
    }
}

impl From<Ipv4Addr> for Host {
    fn from(ip: Ipv4Addr) -> Self {
        Host::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Host {
    fn from(ip: Ipv6Addr) -> Self {
        Host::Ipv6(ip)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Ipv6(ip) => write!(f, "{}", ip),
            Host::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

impl FromStr for Host {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Host, HostParseError> {
        if let Ok(ip) = Ipv4Addr::from_str(s) {
            return Ok(Host::Ipv4(ip));
        }
        if let Ok(ip) = Ipv6Addr::from_str(s) {
            return Ok(Host::Ipv6(ip));
        }
        if s.is_empty() {
            return Err(HostParseError::new("empty host"));
        }
        if s.len() > MAX_FIELD_SIZE {
            return Err(HostParseError::new("host longer than 255 bytes"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._".contains(c))
        {
            return Err(HostParseError::new("invalid character in hostname"));
        }

        Ok(Host::Domain(s.to_owned()))
    }
}

serde_display_tryfrom!(Host);
tryfrom_fromstr!(Host);

/// The endpoint and credentials of a SOCKS5 proxy.
///
/// # Example
/// ```
/// use asyncdns::ProxyAddr;
///
/// let proxy: ProxyAddr = ProxyAddr::new("proxy.example.org".parse::<asyncdns::Host>().unwrap(), 1080)
///     .with_credentials("archer", "hunter2");
///
/// assert_eq!("socks5://proxy.example.org:1080", proxy.to_string());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAddr {
    host: Host,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl ProxyAddr {
    /// Create a proxy address with no credentials.
    pub fn new<H>(host: H, port: u16) -> Self
    where
        H: Into<Host>,
    {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Attach RFC 1929 username/password credentials, offered when the
    /// proxy selects that method.
    pub fn with_credentials<U, P>(mut self, username: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_ref().map(String::as_str)
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(String::as_str)
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "socks5://{}:{}", self.host, self.port)
    }
}

impl ToSocketAddrs for ProxyAddr {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        match &self.host {
            Host::Ipv4(ip) => {
                Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)]
                    .into_iter())
            }
            Host::Ipv6(ip) => {
                Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)]
                    .into_iter())
            }
            Host::Domain(domain) => {
                let addrs: Vec<_> = (domain.as_str(), self.port)
                    .to_socket_addrs()?
                    .collect();
                Ok(addrs.into_iter())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_host() {
        assert_eq!(
            Host::Ipv4(Ipv4Addr::new(127, 0, 0, 1)),
            "127.0.0.1".parse().unwrap()
        );
        assert_eq!(
            Host::Ipv6(Ipv6Addr::LOCALHOST),
            "::1".parse().unwrap()
        );
        assert_eq!(
            Host::Domain("www.example.com".to_owned()),
            "www.example.com".parse().unwrap()
        );

        assert!(Host::from_str("").is_err());
        assert!(Host::from_str("white space").is_err());
    }

    #[test]
    fn test_host_display_round_trip() {
        for host in &["8.8.8.8", "::1", "dns.example.org"] {
            let parsed: Host = host.parse().unwrap();
            assert_eq!(*host, parsed.to_string());
        }
    }

    #[test]
    fn test_proxy_addr_resolution() {
        let proxy = ProxyAddr::new(Ipv4Addr::LOCALHOST, 1080);
        let addrs: Vec<_> =
            proxy.to_socket_addrs().unwrap().collect();
        assert_eq!(vec!["127.0.0.1:1080".parse::<SocketAddr>().unwrap()], addrs);
    }
}
