//! Frame inspection and header rewriting on top of `pnet::packet`.

use std::net::{Ipv4Addr, SocketAddrV4};

use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;

use crate::nat::{FlowKey, Protocol};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Transport facts read from an IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub key: FlowKey,
    /// TCP flags, zero for other transports.
    pub tcp_flags: u8,
    /// Part of a fragmented datagram. Ports are zero unless this is the first fragment.
    pub fragmented: bool,
}

/// An Ethernet frame carrying an IPv4 packet we know how to relay.
#[derive(Debug)]
pub struct Captured<'a> {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub flow: Flow,
    /// The IPv4 packet, link padding removed.
    pub ip: &'a [u8],
}

/// A UDP datagram lifted out of an Ethernet frame.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: &'a [u8],
}

/// Validates the IPv4 header at the start of `buf` and trims anything past
/// its total length.
pub fn ipv4_bytes(buf: &[u8]) -> Option<&[u8]> {
    let ip = Ipv4Packet::new(buf)?;
    let header_len = ip.get_header_length() as usize * 4;
    let total = ip.get_total_length() as usize;
    if ip.get_version() != 4
        || header_len < IPV4_HEADER_LEN
        || total < header_len
        || total > buf.len()
    {
        return None;
    }
    Some(&buf[..total])
}

fn is_fragment(ip: &Ipv4Packet) -> bool {
    ip.get_fragment_offset() != 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0
}

/// Reads the flow identity of a validated IPv4 packet. Transports other than
/// TCP, UDP and ICMP echo yield `None`.
pub fn flow_of(ip: &[u8]) -> Option<Flow> {
    let packet = Ipv4Packet::new(ip)?;
    let protocol = Protocol::from_next_header(packet.get_next_level_protocol())?;
    let fragmented = is_fragment(&packet);
    let mut flow = Flow {
        key: FlowKey {
            protocol,
            src: packet.get_source(),
            src_port: 0,
            dst: packet.get_destination(),
            dst_port: 0,
        },
        tcp_flags: 0,
        fragmented,
    };
    if packet.get_fragment_offset() != 0 {
        return Some(flow);
    }

    let payload = packet.payload();
    match protocol {
        Protocol::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            flow.key.src_port = tcp.get_source();
            flow.key.dst_port = tcp.get_destination();
            flow.tcp_flags = tcp.get_flags();
        }
        Protocol::Udp => {
            let udp = UdpPacket::new(payload)?;
            flow.key.src_port = udp.get_source();
            flow.key.dst_port = udp.get_destination();
        }
        Protocol::Icmp => {
            let icmp = IcmpPacket::new(payload)?;
            let kind = icmp.get_icmp_type();
            if kind != IcmpTypes::EchoRequest && kind != IcmpTypes::EchoReply {
                return None;
            }
            let id = echo_identifier(payload)?;
            flow.key.src_port = id;
            flow.key.dst_port = id;
        }
    }
    Some(flow)
}

fn echo_identifier(icmp: &[u8]) -> Option<u16> {
    // echo request and reply share the identifier offset
    if icmp.len() < 8 {
        return None;
    }
    Some(u16::from_be_bytes([icmp[4], icmp[5]]))
}

/// Parses an Ethernet frame down to a relayable IPv4 flow.
pub fn inspect_frame(frame: &[u8]) -> Option<Captured<'_>> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip = ipv4_bytes(&frame[ETHERNET_HEADER_LEN..])?;
    let flow = flow_of(ip)?;
    Some(Captured {
        src_mac: eth.get_source(),
        dst_mac: eth.get_destination(),
        flow,
        ip,
    })
}

/// Lifts an unfragmented UDP datagram out of an Ethernet frame.
pub fn inspect_udp_frame(frame: &[u8]) -> Option<Datagram<'_>> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip_bytes = ipv4_bytes(&frame[ETHERNET_HEADER_LEN..])?;
    let ip = Ipv4Packet::new(ip_bytes)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp || is_fragment(&ip) {
        return None;
    }

    let header_len = ip.get_header_length() as usize * 4;
    let segment = &ip_bytes[header_len..];
    let udp = UdpPacket::new(segment)?;
    let udp_len = udp.get_length() as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
        return None;
    }

    Some(Datagram {
        src: SocketAddrV4::new(ip.get_source(), udp.get_source()),
        dst: SocketAddrV4::new(ip.get_destination(), udp.get_destination()),
        payload: &segment[UDP_HEADER_LEN..udp_len],
    })
}

#[derive(Clone, Copy)]
enum Side {
    Source,
    Destination,
}

/// Replaces the source address and port (ICMP: echo identifier), fixing
/// every checksum. Returns `None` for packets that cannot be rewritten.
pub fn rewrite_source(ip: &mut [u8], addr: Ipv4Addr, port: u16) -> Option<()> {
    rewrite(ip, Side::Source, addr, port)
}

/// Replaces the destination address and port (ICMP: echo identifier),
/// fixing every checksum.
pub fn rewrite_destination(ip: &mut [u8], addr: Ipv4Addr, port: u16) -> Option<()> {
    rewrite(ip, Side::Destination, addr, port)
}

fn rewrite(ip: &mut [u8], side: Side, addr: Ipv4Addr, port: u16) -> Option<()> {
    let mut packet = MutableIpv4Packet::new(ip)?;
    if is_fragment(&packet.to_immutable()) {
        return None;
    }
    match side {
        Side::Source => packet.set_source(addr),
        Side::Destination => packet.set_destination(addr),
    }
    let (src, dst) = (packet.get_source(), packet.get_destination());
    let protocol = Protocol::from_next_header(packet.get_next_level_protocol())?;

    {
        let payload = packet.payload_mut();
        match protocol {
            Protocol::Tcp => {
                let mut tcp = MutableTcpPacket::new(payload)?;
                match side {
                    Side::Source => tcp.set_source(port),
                    Side::Destination => tcp.set_destination(port),
                }
                let sum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
                tcp.set_checksum(sum);
            }
            Protocol::Udp => {
                let mut udp = MutableUdpPacket::new(payload)?;
                match side {
                    Side::Source => udp.set_source(port),
                    Side::Destination => udp.set_destination(port),
                }
                // zero means the sender skipped the checksum
                if udp.get_checksum() != 0 {
                    let sum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
                    udp.set_checksum(if sum == 0 { 0xffff } else { sum });
                }
            }
            Protocol::Icmp => {
                let mut echo = MutableEchoRequestPacket::new(payload)?;
                echo.set_identifier(port);
                let mut icmp = MutableIcmpPacket::new(echo.packet_mut())?;
                let sum = icmp::checksum(&icmp.to_immutable());
                icmp.set_checksum(sum);
            }
        }
    }

    let sum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(sum);
    Some(())
}

/// Endpoints of an outer UDP frame.
#[derive(Debug, Clone, Copy)]
pub struct UdpRoute {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

/// Builds Ethernet + IPv4 (DF set) + UDP around `payload`.
pub fn build_udp_frame(route: &UdpRoute, identification: u16, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    if ip_len > u16::MAX as usize {
        return None;
    }

    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf)?;
        eth.set_destination(route.dst_mac);
        eth.set_source(route.src_mac);
        eth.set_ethertype(EtherTypes::Ipv4);
    }

    let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_HEADER_LEN..])?;
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(ip_len as u16);
    ip.set_identification(identification);
    ip.set_flags(Ipv4Flags::DontFragment);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip.set_source(*route.src.ip());
    ip.set_destination(*route.dst.ip());
    {
        let mut udp = MutableUdpPacket::new(ip.payload_mut())?;
        udp.set_source(route.src.port());
        udp.set_destination(route.dst.port());
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
        let sum = udp::ipv4_checksum(&udp.to_immutable(), route.src.ip(), route.dst.ip());
        udp.set_checksum(if sum == 0 { 0xffff } else { sum });
    }
    let sum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(sum);
    drop(ip);

    Some(buf)
}

/// Puts an Ethernet header in front of an IPv4 packet.
pub fn build_ipv4_frame(src_mac: MacAddr, dst_mac: MacAddr, ip: &[u8]) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip.len()];
    let mut eth = MutableEthernetPacket::new(&mut buf)?;
    eth.set_destination(dst_mac);
    eth.set_source(src_mac);
    eth.set_ethertype(EtherTypes::Ipv4);
    eth.set_payload(ip);
    drop(eth);
    Some(buf)
}

/// Test and tooling helper: a minimal IPv4 packet around a transport segment.
pub fn build_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: Protocol, segment: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + segment.len();
    let mut buf = vec![0u8; total];
    buf[IPV4_HEADER_LEN..].copy_from_slice(segment);
    if let Some(mut ip) = MutableIpv4Packet::new(&mut buf) {
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(match protocol {
            Protocol::Tcp => IpNextHeaderProtocols::Tcp,
            Protocol::Udp => IpNextHeaderProtocols::Udp,
            Protocol::Icmp => IpNextHeaderProtocols::Icmp,
        });
        ip.set_source(src);
        ip.set_destination(dst);
        let sum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(sum);
    }
    buf
}
