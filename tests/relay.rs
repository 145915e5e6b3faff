use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpType, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;

use burrow::crypto::CryptoCodec;
use burrow::device::{Device, DeviceBinding};
use burrow::encap;
use burrow::filter::FilterSet;
use burrow::link::memory::{self, Peer};
use burrow::nat::{FlowKey, Protocol};
use burrow::packet::{self, build_ipv4, build_ipv4_frame, UdpRoute, IPV4_HEADER_LEN};
use burrow::relay::{Links, RelayConfig, RelayEngine, Shutdown, State};
use burrow::Error;

const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const UPSTREAM: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const UPSTREAM_PORT: u16 = 51000;

const HOST_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x10);
const LISTEN_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
const UPSTREAM_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x02);
const GATEWAY_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x03);

const READ_TIMEOUT: Duration = Duration::from_millis(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn server() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 12345)
}

fn device(name: &str, addr: Ipv4Addr, mac: MacAddr) -> Device {
    Device {
        name: name.into(),
        addrs: vec![addr],
        mac,
        loopback: false,
        up: true,
    }
}

struct Harness {
    engine: RelayEngine,
    shutdown: Shutdown,
    listen: Vec<Peer>,
    upstream: Peer,
    codec: CryptoCodec,
}

impl Harness {
    fn start(filters: &[&str], method: &str, listen_devices: usize) -> Harness {
        Harness::start_with(filters, method, listen_devices, |_| {})
    }

    fn start_with(
        filters: &[&str],
        method: &str,
        listen_devices: usize,
        tweak: impl FnOnce(&mut RelayConfig),
    ) -> Harness {
        let filters = FilterSet::parse(filters).unwrap();
        let mut config = RelayConfig::new(filters, server(), UPSTREAM_PORT);
        config.eviction_interval = Duration::from_millis(50);
        config.drain_timeout = Duration::from_secs(1);
        tweak(&mut config);
        let engine = RelayEngine::new(config, CryptoCodec::new(method, "secret").unwrap());

        let mut devices = Vec::new();
        let mut links = Vec::new();
        let mut listen = Vec::new();
        for i in 0..listen_devices {
            let addr = Ipv4Addr::new(192, 168, 1 + i as u8, 2);
            devices.push(device(&format!("eth{}", i), addr, LISTEN_MAC));
            let (link, peer) = memory::link(READ_TIMEOUT);
            links.push(link);
            listen.push(peer);
        }
        let (upstream_link, upstream) = memory::link(READ_TIMEOUT);

        let binding = DeviceBinding::new(
            devices,
            device("wlan0", UPSTREAM, UPSTREAM_MAC),
            device("gateway", GATEWAY, GATEWAY_MAC),
        )
        .unwrap();
        let shutdown = Shutdown::new();
        engine
            .open(
                binding,
                Links {
                    listen: links,
                    upstream: upstream_link,
                },
                shutdown.clone(),
            )
            .unwrap();
        assert_eq!(engine.state(), State::Open);

        Harness {
            engine,
            shutdown,
            listen,
            upstream,
            codec: CryptoCodec::new(method, "secret").unwrap(),
        }
    }

    /// Waits for the next tunnel datagram and opens it.
    fn tunneled(&self) -> (Vec<u8>, encap::Envelope) {
        let frame = self.upstream.sent.recv_timeout(RECV_TIMEOUT).unwrap();
        let envelope = {
            let datagram = packet::inspect_udp_frame(&frame).unwrap();
            assert_eq!(datagram.src, SocketAddrV4::new(UPSTREAM, UPSTREAM_PORT));
            assert_eq!(datagram.dst, server());
            encap::decode(&self.codec.decrypt(datagram.payload).unwrap()).unwrap()
        };
        (frame, envelope)
    }

    /// Sends `ip` from the server as the reply for translation port `session`.
    fn reply(&self, ip: &[u8], session: u16) {
        let sealed = self.codec.encrypt(&encap::encode(ip, session).unwrap()).unwrap();
        self.reply_raw(&sealed, server());
    }

    fn reply_raw(&self, payload: &[u8], from: SocketAddrV4) {
        let route = UdpRoute {
            src_mac: GATEWAY_MAC,
            dst_mac: UPSTREAM_MAC,
            src: from,
            dst: SocketAddrV4::new(UPSTREAM, UPSTREAM_PORT),
        };
        let frame = packet::build_udp_frame(&route, 7, payload).unwrap();
        self.upstream.inject.send(frame).unwrap();
    }
}

fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, flags: u8) -> Vec<u8> {
    tcp_packet_with(src, dst, flags, &[])
}

fn tcp_packet_with(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20 + payload.len()];
    {
        let mut tcp = MutableTcpPacket::new(&mut seg).unwrap();
        tcp.set_source(src.port());
        tcp.set_destination(dst.port());
        tcp.set_sequence(1000);
        tcp.set_data_offset(5);
        tcp.set_flags(flags);
        tcp.set_window(64240);
        tcp.set_payload(payload);
    }
    let mut ip = build_ipv4(*src.ip(), *dst.ip(), Protocol::Tcp, &seg);
    let sum = {
        let packet = Ipv4Packet::new(&ip).unwrap();
        tcp::ipv4_checksum(&TcpPacket::new(packet.payload()).unwrap(), src.ip(), dst.ip())
    };
    ip[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&sum.to_be_bytes());
    ip
}

fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut seg = vec![0u8; len];
    {
        let mut udp = MutableUdpPacket::new(&mut seg).unwrap();
        udp.set_source(src.port());
        udp.set_destination(dst.port());
        udp.set_length(len as u16);
        udp.set_payload(payload);
        let sum = udp::ipv4_checksum(&udp.to_immutable(), src.ip(), dst.ip());
        udp.set_checksum(sum);
    }
    build_ipv4(*src.ip(), *dst.ip(), Protocol::Udp, &seg)
}

fn echo_packet(src: Ipv4Addr, dst: Ipv4Addr, kind: IcmpType, id: u16) -> Vec<u8> {
    let mut seg = vec![0u8; 12];
    {
        let mut echo = MutableEchoRequestPacket::new(&mut seg).unwrap();
        echo.set_icmp_type(kind);
        echo.set_identifier(id);
        echo.set_sequence_number(1);
        echo.set_payload(b"ping");
    }
    let sum = icmp::checksum(&IcmpPacket::new(&seg).unwrap());
    seg[2..4].copy_from_slice(&sum.to_be_bytes());
    build_ipv4(src, dst, Protocol::Icmp, &seg)
}

fn syn() -> Vec<u8> {
    tcp_packet(
        SocketAddrV4::new(CLIENT, 54321),
        SocketAddrV4::new(REMOTE, 80),
        TcpFlags::SYN,
    )
}

fn capture(peer: &Peer, ip: &[u8]) {
    peer.inject
        .send(build_ipv4_frame(HOST_MAC, LISTEN_MAC, ip).unwrap())
        .unwrap();
}

fn checksums_valid(ip: &[u8]) -> bool {
    let packet = Ipv4Packet::new(ip).unwrap();
    if ipv4::checksum(&packet) != packet.get_checksum() {
        return false;
    }
    let (src, dst) = (packet.get_source(), packet.get_destination());
    match packet.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(packet.payload()).unwrap();
            tcp::ipv4_checksum(&tcp, &src, &dst) == tcp.get_checksum()
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(packet.payload()).unwrap();
            udp::ipv4_checksum(&udp, &src, &dst) == udp.get_checksum()
        }
        _ => true,
    }
}

fn nothing_within(rx: &Receiver<Vec<u8>>, timeout: Duration) -> bool {
    rx.recv_timeout(timeout).is_err()
}

fn syn_round_trip(method: &str) {
    let h = Harness::start(&["93.184.216.34:80"], method, 1);
    capture(&h.listen[0], &syn());

    let (frame, envelope) = h.tunneled();
    let eth = EthernetPacket::new(&frame).unwrap();
    assert_eq!(eth.get_destination(), GATEWAY_MAC);
    assert_eq!(eth.get_source(), UPSTREAM_MAC);
    let outer = Ipv4Packet::new(&frame[14..]).unwrap();
    assert_ne!(outer.get_flags() & Ipv4Flags::DontFragment, 0);

    let port = envelope.session;
    let inner = packet::flow_of(&envelope.packet).unwrap();
    assert_eq!((inner.key.src, inner.key.src_port), (UPSTREAM, port));
    assert_eq!((inner.key.dst, inner.key.dst_port), (REMOTE, 80));
    assert_eq!(inner.tcp_flags, TcpFlags::SYN);
    assert!(checksums_valid(&envelope.packet));

    let key = FlowKey {
        protocol: Protocol::Tcp,
        src: CLIENT,
        src_port: 54321,
        dst: REMOTE,
        dst_port: 80,
    };
    let session = h.engine.nat().get(&key).unwrap();
    assert_eq!(session.port, port);
    assert_ne!(port, UPSTREAM_PORT);

    let syn_ack = tcp_packet(
        SocketAddrV4::new(REMOTE, 80),
        SocketAddrV4::new(UPSTREAM, port),
        TcpFlags::SYN | TcpFlags::ACK,
    );
    h.reply(&syn_ack, port);

    let injected = h.listen[0].sent.recv_timeout(RECV_TIMEOUT).unwrap();
    let eth = EthernetPacket::new(&injected).unwrap();
    assert_eq!(eth.get_destination(), HOST_MAC);
    assert_eq!(eth.get_source(), LISTEN_MAC);
    let ip = packet::ipv4_bytes(&injected[14..]).unwrap();
    let flow = packet::flow_of(ip).unwrap();
    assert_eq!((flow.key.src, flow.key.src_port), (REMOTE, 80));
    assert_eq!((flow.key.dst, flow.key.dst_port), (CLIENT, 54321));
    assert_eq!(flow.tcp_flags, TcpFlags::SYN | TcpFlags::ACK);
    assert!(checksums_valid(ip));

    h.engine.close();
    assert_eq!(h.engine.state(), State::Closed);
    assert!(h.engine.failure().is_none());
}

#[test]
fn syn_round_trip_plain() {
    syn_round_trip("plain");
}

#[test]
fn syn_round_trip_encrypted() {
    syn_round_trip("aes-256-gcm");
    syn_round_trip("chacha20-poly1305");
}

#[test]
fn same_flow_keeps_its_port() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    capture(&h.listen[0], &syn());
    let (_, first) = h.tunneled();
    let ack = tcp_packet(
        SocketAddrV4::new(CLIENT, 54321),
        SocketAddrV4::new(REMOTE, 80),
        TcpFlags::ACK,
    );
    capture(&h.listen[0], &ack);
    let (_, second) = h.tunneled();
    assert_eq!(first.session, second.session);
    assert_eq!(h.engine.nat().len(), 1);
}

#[test]
fn unmatched_traffic_stays_local() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    let https = tcp_packet(
        SocketAddrV4::new(CLIENT, 54321),
        SocketAddrV4::new(REMOTE, 443),
        TcpFlags::SYN,
    );
    capture(&h.listen[0], &https);
    assert!(nothing_within(&h.upstream.sent, Duration::from_millis(200)));
    assert!(h.engine.nat().is_empty());
}

#[test]
fn icmp_echo_uses_identifier() {
    let h = Harness::start(&["93.184.216.34"], "plain", 1);
    capture(&h.listen[0], &echo_packet(CLIENT, REMOTE, IcmpTypes::EchoRequest, 0x4242));

    let (_, envelope) = h.tunneled();
    let port = envelope.session;
    let inner = packet::flow_of(&envelope.packet).unwrap();
    assert_eq!(inner.key.protocol, Protocol::Icmp);
    assert_eq!((inner.key.src, inner.key.src_port), (UPSTREAM, port));

    h.reply(&echo_packet(REMOTE, UPSTREAM, IcmpTypes::EchoReply, port), port);
    let injected = h.listen[0].sent.recv_timeout(RECV_TIMEOUT).unwrap();
    let flow = packet::flow_of(packet::ipv4_bytes(&injected[14..]).unwrap()).unwrap();
    assert_eq!(flow.key.dst, CLIENT);
    assert_eq!(flow.key.dst_port, 0x4242);
}

#[test]
fn bad_datagrams_are_dropped() {
    let h = Harness::start(&["93.184.216.34:80"], "aes-128-gcm", 1);
    capture(&h.listen[0], &syn());
    let (_, envelope) = h.tunneled();
    let port = envelope.session;
    let syn_ack = tcp_packet(
        SocketAddrV4::new(REMOTE, 80),
        SocketAddrV4::new(UPSTREAM, port),
        TcpFlags::SYN | TcpFlags::ACK,
    );

    // unknown session
    let stray = port.wrapping_add(1).max(1024);
    h.reply(&syn_ack, stray);
    // garbage that does not authenticate
    h.reply_raw(&[0u8; 40], server());
    // truncated
    h.reply_raw(&[1, 2, 3], server());
    // valid, but not from the server
    let sealed = h.codec.encrypt(&encap::encode(&syn_ack, port).unwrap()).unwrap();
    h.reply_raw(&sealed, SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 12345));
    assert!(nothing_within(&h.listen[0].sent, Duration::from_millis(200)));

    h.reply(&syn_ack, port);
    assert!(h.listen[0].sent.recv_timeout(RECV_TIMEOUT).is_ok());
    assert_eq!(h.engine.state(), State::Open);
}

#[test]
fn upstream_capture_failure_closes_engine() {
    let Harness {
        engine,
        shutdown,
        listen: _listen,
        upstream,
        ..
    } = Harness::start(&["93.184.216.34:80"], "plain", 1);
    drop(upstream);

    engine.wait();
    assert!(shutdown.is_triggered());
    assert!(engine.failure().unwrap().contains("wlan0"));
    assert_ne!(engine.state(), State::Open);
    engine.close();
    assert_eq!(engine.state(), State::Closed);
}

#[test]
fn upstream_send_failure_closes_engine() {
    let Harness {
        engine,
        listen,
        upstream,
        ..
    } = Harness::start(&["93.184.216.34:80"], "plain", 1);
    let Peer { inject: _inject, sent } = upstream;
    drop(sent);

    capture(&listen[0], &syn());
    engine.wait();
    assert!(engine.failure().is_some());
    engine.close();
    assert_eq!(engine.state(), State::Closed);
}

#[test]
fn listen_failure_leaves_other_devices_running() {
    let mut h = Harness::start(&["93.184.216.34:80"], "plain", 2);
    let first = h.listen.remove(0);
    drop(first);

    // give the first capture loop time to notice
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.engine.state(), State::Open);

    capture(&h.listen[0], &syn());
    let (_, envelope) = h.tunneled();
    let session = h.engine.nat().reverse_lookup(envelope.session).unwrap();
    assert_eq!(session.origin.device, 1);
    assert!(h.engine.failure().is_none());
}

#[test]
fn close_is_prompt_and_idempotent() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    let started = Instant::now();
    h.engine.close();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(h.shutdown.is_triggered());
    assert_eq!(h.engine.state(), State::Closed);

    h.engine.close();
    assert_eq!(h.engine.state(), State::Closed);
    h.engine.wait();
}

#[test]
fn open_twice_is_rejected() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    let (listen, _listen_peer) = memory::link(READ_TIMEOUT);
    let (upstream, _upstream_peer) = memory::link(READ_TIMEOUT);
    let binding = DeviceBinding::new(
        vec![device("eth9", CLIENT, LISTEN_MAC)],
        device("wlan0", UPSTREAM, UPSTREAM_MAC),
        device("gateway", GATEWAY, GATEWAY_MAC),
    )
    .unwrap();
    let result = h.engine.open(
        binding,
        Links {
            listen: vec![listen],
            upstream,
        },
        Shutdown::new(),
    );
    assert!(matches!(result, Err(Error::InvalidState(_))));
    assert_eq!(h.engine.state(), State::Open);
}

#[test]
fn idle_sessions_are_evicted() {
    let mut config = RelayConfig::new(
        FilterSet::parse(&["93.184.216.34:80"]).unwrap(),
        server(),
        UPSTREAM_PORT,
    );
    config.nat.idle_timeout = Duration::from_millis(50);
    config.eviction_interval = Duration::from_millis(20);
    let engine = RelayEngine::new(config, CryptoCodec::plain());

    let (listen_link, listen) = memory::link(READ_TIMEOUT);
    let (upstream_link, upstream) = memory::link(READ_TIMEOUT);
    let binding = DeviceBinding::new(
        vec![device("eth0", Ipv4Addr::new(192, 168, 1, 2), LISTEN_MAC)],
        device("wlan0", UPSTREAM, UPSTREAM_MAC),
        device("gateway", GATEWAY, GATEWAY_MAC),
    )
    .unwrap();
    engine
        .open(
            binding,
            Links {
                listen: vec![listen_link],
                upstream: upstream_link,
            },
            Shutdown::new(),
        )
        .unwrap();

    capture(&listen, &syn());
    upstream.sent.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(engine.nat().len(), 1);

    let deadline = Instant::now() + RECV_TIMEOUT;
    while !engine.nat().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(engine.nat().is_empty());
    engine.close();
}

/// Marks `ip` as the first fragment of a larger datagram.
fn first_fragment(mut ip: Vec<u8>) -> Vec<u8> {
    let mut packet = MutableIpv4Packet::new(&mut ip).unwrap();
    packet.set_flags(Ipv4Flags::MoreFragments);
    let sum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(sum);
    drop(packet);
    ip
}

fn request_with_body(len: usize) -> Vec<u8> {
    tcp_packet_with(
        SocketAddrV4::new(CLIENT, 54321),
        SocketAddrV4::new(REMOTE, 80),
        TcpFlags::ACK | TcpFlags::PSH,
        &vec![0x5a; len],
    )
}

#[test]
fn outer_frame_is_bounded_by_mtu() {
    let h = Harness::start_with(&["93.184.216.34:80"], "plain", 1, |c| c.mtu = 1000);
    // outer IP = 20 + 8 (UDP) + 8 (envelope) + 20 + 20 (inner IP and TCP) + body
    let fits = 1000 - 76;

    capture(&h.listen[0], &request_with_body(fits + 1));
    assert!(nothing_within(&h.upstream.sent, Duration::from_millis(200)));

    capture(&h.listen[0], &request_with_body(fits));
    let (frame, envelope) = h.tunneled();
    assert_eq!(frame.len(), 14 + 1000);
    assert_eq!(envelope.packet.len(), 40 + fits);
    assert_eq!(h.engine.state(), State::Open);
}

#[test]
fn cipher_overhead_counts_against_mtu() {
    let h = Harness::start(&["93.184.216.34:80"], "aes-256-gcm", 1);
    // 12-byte nonce and 16-byte tag on top of the plain layout
    let fits = 1500 - 76 - 28;

    capture(&h.listen[0], &request_with_body(fits + 1));
    assert!(nothing_within(&h.upstream.sent, Duration::from_millis(200)));

    capture(&h.listen[0], &request_with_body(fits));
    let (frame, _) = h.tunneled();
    assert_eq!(frame.len(), 1514);
}

#[test]
fn captured_fragments_are_dropped() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    capture(&h.listen[0], &first_fragment(syn()));
    assert!(nothing_within(&h.upstream.sent, Duration::from_millis(200)));
    assert!(h.engine.nat().is_empty());

    capture(&h.listen[0], &syn());
    h.tunneled();
    assert_eq!(h.engine.nat().len(), 1);
}

#[test]
fn reply_for_another_port_is_dropped() {
    let h = Harness::start(&["93.184.216.34:80"], "plain", 1);
    capture(&h.listen[0], &syn());
    let (_, envelope) = h.tunneled();
    let port = envelope.session;

    let misaddressed = tcp_packet(
        SocketAddrV4::new(REMOTE, 80),
        SocketAddrV4::new(UPSTREAM, port.wrapping_add(1)),
        TcpFlags::SYN | TcpFlags::ACK,
    );
    h.reply(&misaddressed, port);
    assert!(nothing_within(&h.listen[0].sent, Duration::from_millis(200)));

    let syn_ack = tcp_packet(
        SocketAddrV4::new(REMOTE, 80),
        SocketAddrV4::new(UPSTREAM, port),
        TcpFlags::SYN | TcpFlags::ACK,
    );
    h.reply(&syn_ack, port);
    assert!(h.listen[0].sent.recv_timeout(RECV_TIMEOUT).is_ok());
}

#[test]
fn udp_round_trip() {
    let resolver = Ipv4Addr::new(8, 8, 8, 8);
    let h = Harness::start(&[":53"], "chacha20-poly1305", 1);
    let query = udp_packet(
        SocketAddrV4::new(CLIENT, 5353),
        SocketAddrV4::new(resolver, 53),
        b"query",
    );
    capture(&h.listen[0], &query);

    let (_, envelope) = h.tunneled();
    let port = envelope.session;
    let inner = packet::flow_of(&envelope.packet).unwrap();
    assert_eq!(inner.key.protocol, Protocol::Udp);
    assert_eq!((inner.key.src, inner.key.src_port), (UPSTREAM, port));
    assert_eq!((inner.key.dst, inner.key.dst_port), (resolver, 53));
    assert!(checksums_valid(&envelope.packet));

    let answer = udp_packet(
        SocketAddrV4::new(resolver, 53),
        SocketAddrV4::new(UPSTREAM, port),
        b"answer",
    );
    h.reply(&answer, port);

    let injected = h.listen[0].sent.recv_timeout(RECV_TIMEOUT).unwrap();
    let ip = packet::ipv4_bytes(&injected[14..]).unwrap();
    let flow = packet::flow_of(ip).unwrap();
    assert_eq!((flow.key.src, flow.key.src_port), (resolver, 53));
    assert_eq!((flow.key.dst, flow.key.dst_port), (CLIENT, 5353));
    assert!(checksums_valid(ip));
    let udp = UdpPacket::new(&ip[IPV4_HEADER_LEN..]).unwrap();
    assert_eq!(udp.payload(), b"answer");
}

#[test]
fn closed_tcp_session_is_evicted_after_linger() {
    let h = Harness::start_with(&["93.184.216.34:80"], "plain", 1, |c| {
        c.nat.closed_linger = Duration::from_millis(50);
        c.eviction_interval = Duration::from_millis(20);
    });
    let local = SocketAddrV4::new(CLIENT, 54321);
    let remote = SocketAddrV4::new(REMOTE, 80);

    capture(&h.listen[0], &syn());
    let (_, envelope) = h.tunneled();
    let tunnel = SocketAddrV4::new(UPSTREAM, envelope.session);
    h.reply(
        &tcp_packet(remote, tunnel, TcpFlags::SYN | TcpFlags::ACK),
        envelope.session,
    );
    h.listen[0].sent.recv_timeout(RECV_TIMEOUT).unwrap();

    // open sessions outlive the linger
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(h.engine.nat().len(), 1);

    capture(&h.listen[0], &tcp_packet(local, remote, TcpFlags::FIN | TcpFlags::ACK));
    h.tunneled();
    h.reply(
        &tcp_packet(remote, tunnel, TcpFlags::FIN | TcpFlags::ACK),
        envelope.session,
    );
    h.listen[0].sent.recv_timeout(RECV_TIMEOUT).unwrap();

    let deadline = Instant::now() + RECV_TIMEOUT;
    while !h.engine.nat().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(h.engine.nat().is_empty());
    assert!(h.engine.nat().reverse_lookup(envelope.session).is_none());
}

#[test]
fn reset_closes_session() {
    let h = Harness::start_with(&["93.184.216.34:80"], "plain", 1, |c| {
        c.nat.closed_linger = Duration::from_millis(50);
        c.eviction_interval = Duration::from_millis(20);
    });
    capture(&h.listen[0], &syn());
    h.tunneled();
    let rst = tcp_packet(
        SocketAddrV4::new(CLIENT, 54321),
        SocketAddrV4::new(REMOTE, 80),
        TcpFlags::RST,
    );
    capture(&h.listen[0], &rst);
    h.tunneled();

    let deadline = Instant::now() + RECV_TIMEOUT;
    while !h.engine.nat().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(h.engine.nat().is_empty());
}
