//! Device discovery.
//!
//! Listen devices are where proxied hosts live; the upstream device carries
//! the tunnel to the server through the gateway found in the kernel's
//! default route.

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::thread;
use std::time::Duration;

use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;
use tracing::debug;

const ROUTE_TABLE: &str = "/proc/net/route";
const ARP_TABLE: &str = "/proc/net/arp";
const RTF_UP: u32 = 0x1;
const ARP_ATTEMPTS: usize = 3;
const ARP_WAIT: Duration = Duration::from_millis(300);

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("cannot choose between devices {0}")]
    AmbiguousDevice(String),

    #[error("cannot determine device: {0}")]
    NoDevice(String),

    #[error("open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub addrs: Vec<Ipv4Addr>,
    pub mac: MacAddr,
    pub loopback: bool,
    pub up: bool,
}

impl Device {
    pub fn from_interface(iface: &NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            addrs: iface
                .ips
                .iter()
                .filter_map(|net| match net.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            mac: iface.mac.unwrap_or_else(MacAddr::zero),
            loopback: iface.is_loopback(),
            up: iface.is_up(),
        }
    }

    /// The first IPv4 address bound to the device.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.first().copied()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<String> = self.addrs.iter().map(Ipv4Addr::to_string).collect();
        write!(f, "{} [{}] {}", self.name, addrs.join(", "), self.mac)?;
        if self.loopback {
            f.write_str(" (loopback)")?;
        }
        Ok(())
    }
}

/// Every device pnet can see.
pub fn list_all_devices() -> Vec<Device> {
    datalink::interfaces()
        .iter()
        .map(Device::from_interface)
        .collect()
}

pub fn find_listen_devices(names: &[String]) -> Result<Vec<Device>, DeviceError> {
    select_listen_devices(&list_all_devices(), names)
}

/// Picks the named devices, or with no names every up, non-loopback device
/// that has an IPv4 address.
pub fn select_listen_devices(all: &[Device], names: &[String]) -> Result<Vec<Device>, DeviceError> {
    if names.is_empty() {
        let picked: Vec<Device> = all
            .iter()
            .filter(|d| !d.loopback && d.up && d.ipv4().is_some())
            .cloned()
            .collect();
        if picked.is_empty() {
            return Err(DeviceError::NoDevice(
                "no up, non-loopback device with an IPv4 address".into(),
            ));
        }
        return Ok(picked);
    }

    names
        .iter()
        .map(|name| {
            all.iter()
                .find(|d| &d.name == name)
                .cloned()
                .ok_or_else(|| DeviceError::DeviceNotFound(name.clone()))
        })
        .collect()
}

/// One line of the kernel IPv4 routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub iface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub flags: u32,
    pub metric: u32,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.is_unspecified() && self.mask.is_unspecified() && self.flags & RTF_UP != 0
    }
}

fn proc_addr(hex: &str) -> Option<Ipv4Addr> {
    u32::from_str_radix(hex, 16)
        .ok()
        .map(|v| Ipv4Addr::from(v.to_le_bytes()))
}

/// Parses the text of `/proc/net/route`.
pub fn parse_routes(table: &str) -> Vec<Route> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            Some(Route {
                iface: fields[0].to_string(),
                destination: proc_addr(fields[1])?,
                gateway: proc_addr(fields[2])?,
                flags: u32::from_str_radix(fields[3], 16).ok()?,
                metric: fields[6].parse().ok()?,
                mask: proc_addr(fields[7])?,
            })
        })
        .collect()
}

/// Parses the text of `/proc/net/arp` into complete (ip, mac, device) entries.
pub fn parse_arp(table: &str) -> Vec<(Ipv4Addr, MacAddr, String)> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let ip: Ipv4Addr = fields[0].parse().ok()?;
            let mac: MacAddr = fields[3].parse().ok()?;
            if mac == MacAddr::zero() {
                return None;
            }
            Some((ip, mac, fields[5].to_string()))
        })
        .collect()
}

/// Chooses the upstream device and the gateway address behind it.
///
/// A loopback upstream has no gateway. Without a name the default route with
/// the lowest metric decides, and equal metrics on different devices are
/// ambiguous.
pub fn select_upstream(
    all: &[Device],
    routes: &[Route],
    name: &str,
) -> Result<(Device, Option<Ipv4Addr>), DeviceError> {
    let mut defaults: Vec<&Route> = routes.iter().filter(|r| r.is_default()).collect();
    defaults.sort_by_key(|r| r.metric);

    let iface = if name.is_empty() {
        let best = defaults
            .first()
            .ok_or_else(|| DeviceError::NoDevice("no default route".into()))?;
        let mut tied: Vec<&str> = defaults
            .iter()
            .filter(|r| r.metric == best.metric)
            .map(|r| r.iface.as_str())
            .collect();
        tied.sort_unstable();
        tied.dedup();
        if tied.len() > 1 {
            return Err(DeviceError::AmbiguousDevice(tied.join(", ")));
        }
        best.iface.clone()
    } else {
        name.to_string()
    };

    let device = all
        .iter()
        .find(|d| d.name == iface)
        .cloned()
        .ok_or_else(|| DeviceError::DeviceNotFound(iface.clone()))?;
    if device.ipv4().is_none() {
        return Err(DeviceError::NoDevice(format!("{} has no IPv4 address", iface)));
    }
    if device.loopback {
        return Ok((device, None));
    }

    let gateway = defaults
        .iter()
        .find(|r| r.iface == iface)
        .map(|r| r.gateway)
        .ok_or_else(|| DeviceError::NoDevice(format!("no default route via {}", iface)))?;
    Ok((device, Some(gateway)))
}

fn lookup_arp(ip: Ipv4Addr, iface: &str) -> Result<Option<MacAddr>, DeviceError> {
    let table = fs::read_to_string(ARP_TABLE)?;
    Ok(parse_arp(&table)
        .into_iter()
        .find(|(entry_ip, _, entry_iface)| *entry_ip == ip && entry_iface == iface)
        .map(|(_, mac, _)| mac))
}

/// Reads the gateway's hardware address from the neighbour cache, nudging
/// the kernel into resolving it when the entry is missing.
fn resolve_gateway_mac(ip: Ipv4Addr, iface: &str) -> Result<MacAddr, DeviceError> {
    for attempt in 0..ARP_ATTEMPTS {
        if let Some(mac) = lookup_arp(ip, iface)? {
            return Ok(mac);
        }
        debug!("gateway {} not in neighbour cache (attempt {})", ip, attempt + 1);
        // any datagram routed at the gateway makes the kernel ARP for it
        if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
            let _ = socket.send_to(&[0], (ip, 9));
        }
        thread::sleep(ARP_WAIT);
    }
    Err(DeviceError::NoDevice(format!(
        "hardware address of gateway {} on {}",
        ip, iface
    )))
}

/// Resolves the upstream device and the gateway device record.
pub fn find_upstream_and_gateway(name: &str) -> Result<(Device, Device), DeviceError> {
    let all = list_all_devices();
    let routes = parse_routes(&fs::read_to_string(ROUTE_TABLE)?);
    let (upstream, gateway_ip) = select_upstream(&all, &routes, name)?;

    let gateway = match gateway_ip {
        None => upstream.clone(),
        Some(ip) => Device {
            name: upstream.name.clone(),
            addrs: vec![ip],
            mac: resolve_gateway_mac(ip, &upstream.name)?,
            loopback: false,
            up: true,
        },
    };
    Ok((upstream, gateway))
}

/// The devices one engine runs on.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub listen: Vec<Device>,
    pub upstream: Device,
    pub gateway: Device,
}

impl DeviceBinding {
    pub fn resolve(listen: &[String], upstream: &str) -> Result<Self, DeviceError> {
        let listen = find_listen_devices(listen)?;
        let (upstream, gateway) = find_upstream_and_gateway(upstream)?;
        Self::new(listen, upstream, gateway)
    }

    pub fn new(
        listen: Vec<Device>,
        upstream: Device,
        gateway: Device,
    ) -> Result<Self, DeviceError> {
        if listen.is_empty() {
            return Err(DeviceError::NoDevice("no listen device".into()));
        }
        if upstream.ipv4().is_none() {
            return Err(DeviceError::NoDevice(format!(
                "{} has no IPv4 address",
                upstream.name
            )));
        }
        Ok(Self {
            listen,
            upstream,
            gateway,
        })
    }

    /// Source address of tunnel datagrams.
    pub fn upstream_addr(&self) -> Ipv4Addr {
        self.upstream.ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}
