//! Client-side session table.
//!
//! Each local flow gets a translation port. Outbound packets carry that port
//! as their source port inside the tunnel, and replies come back addressed
//! to it, which is how the inbound path finds the original requester again.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::tcp::TcpFlags;
use pnet::util::MacAddr;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatError {
    #[error("no free translation port ({live} live sessions)")]
    PortsExhausted { live: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    /// ICMP echo; the identifier stands in for the port.
    Icmp,
}

impl Protocol {
    pub fn from_next_header(proto: IpNextHeaderProtocol) -> Option<Self> {
        match proto {
            IpNextHeaderProtocols::Tcp => Some(Protocol::Tcp),
            IpNextHeaderProtocols::Udp => Some(Protocol::Udp),
            IpNextHeaderProtocols::Icmp => Some(Protocol::Icmp),
            _ => None,
        }
    }

    pub fn has_ports(&self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Icmp => f.write_str("icmp"),
        }
    }
}

/// Identity of a local flow as captured on a listen device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// Where replies for a flow are injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Index of the listen device the flow was captured on.
    pub device: usize,
    /// Hardware address of the requesting host.
    pub host_mac: MacAddr,
    /// Hardware address the host sent its frames to.
    pub hop_mac: MacAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Teardown {
    fin_out: bool,
    fin_in: bool,
    reset: bool,
}

impl Teardown {
    fn closed(&self) -> bool {
        self.reset || (self.fin_out && self.fin_in)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: FlowKey,
    pub port: u16,
    pub origin: Origin,
    pub last_active: Instant,
    teardown: Teardown,
}

impl Session {
    /// TCP session that saw a reset or a FIN each way.
    pub fn is_closed(&self) -> bool {
        self.teardown.closed()
    }
}

#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Idle time after which a session is evicted.
    pub idle_timeout: Duration,
    /// Grace period kept after a TCP close so trailing ACKs still map.
    pub closed_linger: Duration,
    pub port_range: RangeInclusive<u16>,
    /// Ports probed per allocation before giving up.
    pub max_alloc_retries: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            closed_linger: Duration::from_secs(10),
            port_range: 1024..=65535,
            max_alloc_retries: 65535 - 1024 + 1,
        }
    }
}

struct Inner {
    by_key: HashMap<FlowKey, Session>,
    by_port: HashMap<u16, FlowKey>,
    cursor: u16,
}

pub struct NatTable {
    inner: Mutex<Inner>,
    config: NatConfig,
    /// Never handed out; this is the engine's own upstream port.
    reserved: u16,
}

impl NatTable {
    pub fn new(config: NatConfig, reserved: u16) -> Self {
        let (lo, hi) = (*config.port_range.start(), *config.port_range.end());
        let cursor = if lo < hi {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };

        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                by_port: HashMap::new(),
                cursor,
            }),
            config,
            reserved,
        }
    }

    /// Returns the translation port of `key`, creating a session when the flow
    /// is new. Either way the session is marked active.
    pub fn assign_or_lookup(&self, key: FlowKey, origin: Origin) -> Result<u16, NatError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(session) = inner.by_key.get_mut(&key) {
            session.last_active = now;
            session.origin = origin;
            return Ok(session.port);
        }

        let port = self.allocate(&mut inner)?;
        inner.by_port.insert(port, key);
        inner.by_key.insert(
            key,
            Session {
                key,
                port,
                origin,
                last_active: now,
                teardown: Teardown::default(),
            },
        );
        Ok(port)
    }

    /// Finds the session holding `port` and marks it active.
    pub fn reverse_lookup(&self, port: u16) -> Option<Session> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let key = *inner.by_port.get(&port)?;
        let session = inner.by_key.get_mut(&key)?;
        session.last_active = now;
        Some(session.clone())
    }

    /// Feeds TCP flags seen on the session holding `port` into its close tracking.
    pub fn record_tcp_flags(&self, port: u16, direction: Direction, flags: u8) {
        let mut inner = self.inner.lock();
        let Some(key) = inner.by_port.get(&port).copied() else {
            return;
        };
        let Some(session) = inner.by_key.get_mut(&key) else {
            return;
        };

        let syn = flags & TcpFlags::SYN != 0;
        let ack = flags & TcpFlags::ACK != 0;
        if direction == Direction::Outbound && syn && !ack {
            // a fresh connect reusing the same local port
            session.teardown = Teardown::default();
        }
        if flags & TcpFlags::RST != 0 {
            session.teardown.reset = true;
        }
        if flags & TcpFlags::FIN != 0 {
            match direction {
                Direction::Outbound => session.teardown.fin_out = true,
                Direction::Inbound => session.teardown.fin_in = true,
            }
        }
    }

    /// Drops idle and closed sessions, freeing their ports. Returns how many
    /// were removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let idle = self.config.idle_timeout;
        let linger = self.config.closed_linger;

        let expired: Vec<FlowKey> = inner
            .by_key
            .values()
            .filter(|s| {
                let quiet = now.saturating_duration_since(s.last_active);
                quiet > idle || (s.is_closed() && quiet > linger)
            })
            .map(|s| s.key)
            .collect();

        for key in &expired {
            if let Some(session) = inner.by_key.remove(key) {
                inner.by_port.remove(&session.port);
            }
        }
        expired.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Session> {
        self.inner.lock().by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self, inner: &mut Inner) -> Result<u16, NatError> {
        let (lo, hi) = (*self.config.port_range.start(), *self.config.port_range.end());
        let span = (hi as usize).saturating_sub(lo as usize) + 1;

        for _ in 0..self.config.max_alloc_retries.min(span) {
            let port = inner.cursor;
            inner.cursor = if port >= hi || port < lo { lo } else { port + 1 };

            if port < lo || port > hi || port == self.reserved {
                continue;
            }
            if !inner.by_port.contains_key(&port) {
                return Ok(port);
            }
        }

        Err(NatError::PortsExhausted {
            live: inner.by_key.len(),
        })
    }
}
