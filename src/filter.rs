//! Proxy filters.
//!
//! A filter names traffic that should go through the tunnel. Three textual
//! forms are accepted: `ip`, `:port` and `ip:port`.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("empty filter")]
    Empty,

    #[error("invalid address \"{0}\"")]
    InvalidAddress(String),

    #[error("invalid port \"{0}\"")]
    InvalidPort(String),

    #[error("IPv6 address \"{0}\" is not supported")]
    Ipv6Unsupported(String),

    #[error("\"{0}\" is missing a port")]
    MissingPort(String),

    #[error("\"{0}\" is missing an address")]
    MissingAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Ip(Ipv4Addr),
    Port(u16),
    IpPort(Ipv4Addr, u16),
}

impl Filter {
    /// The destination port this filter pins, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Filter::Ip(_) => None,
            Filter::Port(port) | Filter::IpPort(_, port) => Some(*port),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Ip(ip) => write!(f, "{}", ip),
            Filter::Port(port) => write!(f, ":{}", port),
            Filter::IpPort(ip, port) => write!(f, "{}:{}", ip, port),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_filter(s)
    }
}

/// Parses `ip`, `:port` or `ip:port`.
pub fn parse_filter(s: &str) -> Result<Filter, FilterError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FilterError::Empty);
    }

    if let Some(port) = s.strip_prefix(':') {
        return Ok(Filter::Port(parse_port(port)?));
    }

    match s.rsplit_once(':') {
        Some((ip, port)) => Ok(Filter::IpPort(parse_ip(ip)?, parse_port(port)?)),
        None => Ok(Filter::Ip(parse_ip(s)?)),
    }
}

/// Parses a full `ip:port` endpoint such as the server address.
pub fn parse_ip_port(s: &str) -> Result<SocketAddrV4, FilterError> {
    match parse_filter(s)? {
        Filter::IpPort(ip, port) => Ok(SocketAddrV4::new(ip, port)),
        Filter::Ip(_) => Err(FilterError::MissingPort(s.trim().to_string())),
        Filter::Port(_) => Err(FilterError::MissingAddress(s.trim().to_string())),
    }
}

fn parse_ip(s: &str) -> Result<Ipv4Addr, FilterError> {
    let s = s.trim();
    let s = s
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(s);
    if s.is_empty() {
        return Err(FilterError::InvalidAddress(s.to_string()));
    }
    if s.contains(':') {
        return Err(FilterError::Ipv6Unsupported(s.to_string()));
    }
    s.parse()
        .map_err(|_| FilterError::InvalidAddress(s.to_string()))
}

fn parse_port(s: &str) -> Result<u16, FilterError> {
    let s = s.trim();
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(FilterError::InvalidPort(s.to_string())),
        Ok(port) => Ok(port),
    }
}

/// The filters of one engine, indexed so a match is a few hash lookups.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
    ips: HashSet<Ipv4Addr>,
    ports: HashSet<u16>,
    ip_ports: HashSet<(Ipv4Addr, u16)>,
}

impl FilterSet {
    pub fn new(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut set = FilterSet::default();
        for filter in filters {
            set.insert(filter);
        }
        set
    }

    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, FilterError> {
        let filters = specs
            .iter()
            .map(|s| parse_filter(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterSet::new(filters))
    }

    fn insert(&mut self, filter: Filter) {
        let fresh = match filter {
            Filter::Ip(ip) => self.ips.insert(ip),
            Filter::Port(port) => self.ports.insert(port),
            Filter::IpPort(ip, port) => self.ip_ports.insert((ip, port)),
        };
        if fresh {
            self.filters.push(filter);
        }
    }

    /// True when any filter selects a packet heading to `dst`/`dst_port`.
    ///
    /// `dst_port` is `None` for transports without ports (ICMP), which only an
    /// address filter can select.
    pub fn matches(&self, dst: Ipv4Addr, dst_port: Option<u16>) -> bool {
        if self.ips.contains(&dst) {
            return true;
        }
        match dst_port {
            Some(port) => self.ports.contains(&port) || self.ip_ports.contains(&(dst, port)),
            None => false,
        }
    }

    /// Every port pinned by a port or address-and-port filter.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.filters.iter().filter_map(Filter::port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
