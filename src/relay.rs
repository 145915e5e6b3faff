//! The relay engine.
//!
//! One capture loop per listen device tunnels matching packets to the
//! server; one loop on the upstream device unwraps the server's replies and
//! injects them back where the flow came from; a ticker evicts idle
//! sessions. The loops share only the session table and the upstream send
//! handle.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::crypto::{CryptoCodec, CryptoError};
use crate::device::{Device, DeviceBinding, DeviceError};
use crate::encap::{self, DecodeError, EncodeError};
use crate::error::{Error, Result};
use crate::filter::FilterSet;
use crate::link::{self, FrameReader, FrameWriter, Link};
use crate::nat::{Direction, NatConfig, NatError, NatTable, Origin, Protocol};
use crate::packet::{self, UdpRoute, ETHERNET_HEADER_LEN};
use crate::workers::WorkerGroup;

/// Cooperative stop signal shared by the engine's loops and its owner.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Blocks until triggered.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            self.inner.cond.wait(&mut guard);
        }
    }

    /// Blocks until triggered or `timeout` passes. Returns whether it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_triggered()
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub filters: FilterSet,
    pub server: SocketAddrV4,
    pub upstream_port: u16,
    pub nat: NatConfig,
    /// Largest outer IP packet sent on the upstream device.
    pub mtu: usize,
    pub eviction_interval: Duration,
    /// How long `close` waits for the loops to stop.
    pub drain_timeout: Duration,
}

impl RelayConfig {
    pub fn new(filters: FilterSet, server: SocketAddrV4, upstream_port: u16) -> Self {
        Self {
            filters,
            server,
            upstream_port,
            nat: NatConfig::default(),
            mtu: 1500,
            eviction_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(3),
        }
    }
}

/// Open handles for every device of a [`DeviceBinding`], listen links in the
/// same order as the binding's listen devices.
pub struct Links {
    pub listen: Vec<Link>,
    pub upstream: Link,
}

impl Links {
    pub fn open(
        binding: &DeviceBinding,
        read_timeout: Duration,
    ) -> std::result::Result<Self, DeviceError> {
        let listen = binding
            .listen
            .iter()
            .map(|device| link::open(device, read_timeout))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let upstream = link::open(&binding.upstream, read_timeout)?;
        Ok(Self { listen, upstream })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Open,
    Closing,
    Closed,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Open => "open",
            State::Closing => "closing",
            State::Closed => "closed",
        }
    }
}

/// Why a single packet was not relayed.
#[derive(Debug, thiserror::Error)]
enum PacketError {
    #[error("fragmented packet")]
    Fragmented,

    #[error("malformed embedded packet")]
    Malformed,

    #[error("headers cannot be rewritten")]
    Rewrite,

    #[error("frame of {0} bytes exceeds the upstream MTU of {1}")]
    Oversize(usize, usize),

    #[error("no session for translation port {0}")]
    UnknownSession(u16),

    #[error("embedded packet does not belong to translation port {0}")]
    SessionMismatch(u16),

    #[error("listen device {0} is down")]
    DeviceDown(String),

    #[error(transparent)]
    Nat(#[from] NatError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

struct Listener {
    device: Device,
    alive: AtomicBool,
    injector: Mutex<Box<dyn FrameWriter>>,
}

/// State the loops share.
struct Relay {
    filters: FilterSet,
    server: SocketAddrV4,
    upstream_port: u16,
    upstream_addr: Ipv4Addr,
    upstream_name: String,
    mtu: usize,
    route: UdpRoute,
    crypto: Arc<CryptoCodec>,
    nat: Arc<NatTable>,
    upstream: Mutex<Box<dyn FrameWriter>>,
    listeners: Vec<Listener>,
    identification: AtomicU16,
    shutdown: Shutdown,
    state: Arc<Mutex<State>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl Relay {
    /// Upstream trouble ends the whole engine.
    fn fail(&self, reason: String) {
        error!("{}", reason);
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        {
            let mut state = self.state.lock();
            if *state == State::Open {
                *state = State::Closing;
            }
        }
        self.shutdown.trigger();
    }

    fn outbound(&self, device: usize, frame: &[u8]) -> std::result::Result<(), PacketError> {
        let Some(captured) = packet::inspect_frame(frame) else {
            return Ok(());
        };
        let key = captured.flow.key;

        // the engine's own tunnel datagrams when a listen device is also upstream
        if key.protocol == Protocol::Udp
            && key.src == self.upstream_addr
            && key.src_port == self.upstream_port
        {
            return Ok(());
        }

        let dst_port = key.protocol.has_ports().then_some(key.dst_port);
        if !self.filters.matches(key.dst, dst_port) {
            return Ok(());
        }
        if captured.flow.fragmented {
            return Err(PacketError::Fragmented);
        }

        let origin = Origin {
            device,
            host_mac: captured.src_mac,
            hop_mac: captured.dst_mac,
        };
        let port = self.nat.assign_or_lookup(key, origin)?;
        if key.protocol == Protocol::Tcp {
            self.nat
                .record_tcp_flags(port, Direction::Outbound, captured.flow.tcp_flags);
        }

        let mut ip = captured.ip.to_vec();
        packet::rewrite_source(&mut ip, self.upstream_addr, port).ok_or(PacketError::Rewrite)?;
        let envelope = encap::encode(&ip, port)?;
        let sealed = self.crypto.encrypt(&envelope)?;

        let identification = self.identification.fetch_add(1, Ordering::Relaxed);
        let outer = packet::build_udp_frame(&self.route, identification, &sealed)
            .ok_or(PacketError::Oversize(sealed.len(), self.mtu))?;
        let outer_len = outer.len() - ETHERNET_HEADER_LEN;
        if outer_len > self.mtu {
            return Err(PacketError::Oversize(outer_len, self.mtu));
        }

        trace!("{} via :{}", key, port);
        if let Err(e) = self.upstream.lock().send_frame(&outer) {
            self.fail(format!("send on upstream device {}: {}", self.upstream_name, e));
        }
        Ok(())
    }

    fn inbound(&self, frame: &[u8]) -> std::result::Result<(), PacketError> {
        let Some(datagram) = packet::inspect_udp_frame(frame) else {
            return Ok(());
        };
        if datagram.src != self.server || datagram.dst.port() != self.upstream_port {
            return Ok(());
        }

        let opened = self.crypto.decrypt(datagram.payload)?;
        let envelope = encap::decode(&opened)?;
        let mut ip = envelope.packet;
        let len = packet::ipv4_bytes(&ip).ok_or(PacketError::Malformed)?.len();
        ip.truncate(len);
        let flow = packet::flow_of(&ip).ok_or(PacketError::Malformed)?;
        if flow.fragmented {
            return Err(PacketError::Fragmented);
        }

        let session = self
            .nat
            .reverse_lookup(envelope.session)
            .ok_or(PacketError::UnknownSession(envelope.session))?;
        if flow.key.protocol != session.key.protocol || flow.key.dst_port != session.port {
            return Err(PacketError::SessionMismatch(session.port));
        }
        if flow.key.protocol == Protocol::Tcp {
            self.nat
                .record_tcp_flags(session.port, Direction::Inbound, flow.tcp_flags);
        }

        packet::rewrite_destination(&mut ip, session.key.src, session.key.src_port)
            .ok_or(PacketError::Rewrite)?;

        let listener = self
            .listeners
            .get(session.origin.device)
            .ok_or_else(|| PacketError::DeviceDown(session.origin.device.to_string()))?;
        if !listener.alive.load(Ordering::SeqCst) {
            return Err(PacketError::DeviceDown(listener.device.name.clone()));
        }

        let reply = packet::build_ipv4_frame(session.origin.hop_mac, session.origin.host_mac, &ip)
            .ok_or(PacketError::Rewrite)?;
        trace!("{} back from :{}", session.key, session.port);
        if let Err(e) = listener.injector.lock().send_frame(&reply) {
            error!("inject on {}: {}", listener.device.name, e);
            listener.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn capture_loop(&self, index: usize, mut reader: Box<dyn FrameReader>) {
        let listener = &self.listeners[index];
        info!("capturing on {}", listener.device.name);

        while !self.shutdown.is_triggered() && listener.alive.load(Ordering::SeqCst) {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    error!("capture on {}: {}", listener.device.name, e);
                    listener.alive.store(false, Ordering::SeqCst);
                    break;
                }
            };
            if let Err(e) = self.outbound(index, frame) {
                debug!("dropped packet from {}: {}", listener.device.name, e);
            }
        }

        if !self.shutdown.is_triggered() {
            warn!("stopped capturing on {}", listener.device.name);
            if !self.listeners.iter().any(|l| l.alive.load(Ordering::SeqCst)) {
                warn!("no listen device left");
            }
        }
    }

    fn upstream_loop(&self, mut reader: Box<dyn FrameReader>) {
        info!("receiving on {}", self.upstream_name);

        while !self.shutdown.is_triggered() {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    self.fail(format!("capture on upstream device {}: {}", self.upstream_name, e));
                    break;
                }
            };
            if let Err(e) = self.inbound(frame) {
                debug!("dropped datagram from {}: {}", self.server, e);
            }
        }
    }

    fn eviction_loop(&self, interval: Duration) {
        while !self.shutdown.wait_timeout(interval) {
            let evicted = self.nat.evict_expired(Instant::now());
            if evicted > 0 {
                debug!("evicted {} sessions, {} live", evicted, self.nat.len());
            }
        }
    }
}

pub struct RelayEngine {
    config: RelayConfig,
    crypto: Arc<CryptoCodec>,
    nat: Arc<NatTable>,
    state: Arc<Mutex<State>>,
    failure: Arc<Mutex<Option<String>>>,
    shutdown: Mutex<Option<Shutdown>>,
    workers: Mutex<Option<WorkerGroup>>,
}

impl RelayEngine {
    pub fn new(config: RelayConfig, crypto: CryptoCodec) -> Self {
        let nat = Arc::new(NatTable::new(config.nat.clone(), config.upstream_port));
        Self {
            config,
            crypto: Arc::new(crypto),
            nat,
            state: Arc::new(Mutex::new(State::Created)),
            failure: Arc::new(Mutex::new(None)),
            shutdown: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Why the engine closed itself, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Starts the loops and returns. `shutdown` firing (from the owner or an
    /// upstream failure) makes every loop stop at its next read timeout.
    pub fn open(&self, binding: DeviceBinding, links: Links, shutdown: Shutdown) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Created {
            return Err(Error::InvalidState(state.as_str()));
        }
        if links.listen.len() != binding.listen.len() {
            return Err(Error::config(format!(
                "{} listen devices but {} links",
                binding.listen.len(),
                links.listen.len()
            )));
        }

        let upstream_addr = binding.upstream_addr();
        let mut readers = Vec::with_capacity(links.listen.len());
        let mut listeners = Vec::with_capacity(links.listen.len());
        for (device, link) in binding.listen.into_iter().zip(links.listen) {
            readers.push(link.reader);
            listeners.push(Listener {
                device,
                alive: AtomicBool::new(true),
                injector: Mutex::new(link.writer),
            });
        }

        let relay = Arc::new(Relay {
            filters: self.config.filters.clone(),
            server: self.config.server,
            upstream_port: self.config.upstream_port,
            upstream_addr,
            upstream_name: binding.upstream.name.clone(),
            mtu: self.config.mtu,
            route: UdpRoute {
                src_mac: binding.upstream.mac,
                dst_mac: binding.gateway.mac,
                src: SocketAddrV4::new(upstream_addr, self.config.upstream_port),
                dst: self.config.server,
            },
            crypto: Arc::clone(&self.crypto),
            nat: Arc::clone(&self.nat),
            upstream: Mutex::new(links.upstream.writer),
            listeners,
            identification: AtomicU16::new(rand::random()),
            shutdown: shutdown.clone(),
            state: Arc::clone(&self.state),
            failure: Arc::clone(&self.failure),
        });

        let mut workers = WorkerGroup::new();
        let spawned = spawn_loops(
            &mut workers,
            &relay,
            readers,
            links.upstream.reader,
            self.config.eviction_interval,
        );
        if let Err(e) = spawned {
            shutdown.trigger();
            drop(state);
            workers.join_within(self.config.drain_timeout);
            *self.state.lock() = State::Closed;
            return Err(Error::Io(e));
        }

        info!(
            "relay open: {} listen device(s), upstream {} ({}:{}) via {}, server {}",
            relay.listeners.len(),
            relay.upstream_name,
            upstream_addr,
            self.config.upstream_port,
            binding.gateway.mac,
            self.config.server
        );

        *self.shutdown.lock() = Some(shutdown);
        *self.workers.lock() = Some(workers);
        *state = State::Open;
        Ok(())
    }

    /// Blocks until the engine is told to stop or stops itself.
    pub fn wait(&self) {
        let shutdown = self.shutdown.lock().clone();
        if let Some(shutdown) = shutdown {
            shutdown.wait();
        }
    }

    /// Stops every loop and releases the devices. Safe to call repeatedly.
    pub fn close(&self) {
        let workers = {
            let mut state = self.state.lock();
            match *state {
                State::Closed => return,
                State::Created => {
                    *state = State::Closed;
                    return;
                }
                State::Open | State::Closing => *state = State::Closing,
            }
            self.workers.lock().take()
        };
        let Some(mut workers) = workers else {
            return;
        };

        info!("closing relay");
        if let Some(shutdown) = self.shutdown.lock().as_ref() {
            shutdown.trigger();
        }
        let stragglers = workers.join_within(self.config.drain_timeout);
        if !stragglers.is_empty() {
            warn!("left running: {}", stragglers.join(", "));
        }

        *self.state.lock() = State::Closed;
        info!("relay closed, {} sessions dropped", self.nat.len());
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_loops(
    workers: &mut WorkerGroup,
    relay: &Arc<Relay>,
    readers: Vec<Box<dyn FrameReader>>,
    upstream_reader: Box<dyn FrameReader>,
    eviction_interval: Duration,
) -> std::io::Result<()> {
    for (index, reader) in readers.into_iter().enumerate() {
        let r = Arc::clone(relay);
        let name = format!("capture-{}", relay.listeners[index].device.name);
        workers.spawn(name, move || r.capture_loop(index, reader))?;
    }

    let r = Arc::clone(relay);
    workers.spawn("upstream", move || r.upstream_loop(upstream_reader))?;

    let r = Arc::clone(relay);
    workers.spawn("nat-evict", move || r.eviction_loop(eviction_interval))?;
    Ok(())
}
