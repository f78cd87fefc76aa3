// src/packet.rs

//! Raw IPv4/TCP/UDP header handling.
//!
//! Everything here operates on plain byte slices holding an IPv4 datagram
//! (no link-layer header), so it is independent of the capture driver.

use std::net::{Ipv4Addr, SocketAddrV4};

use log::trace;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};

use crate::error::{Error, Result};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    /// Total datagram length from the header
    pub total_len: usize,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the payload from the start of the datagram
    pub payload_offset: usize,
    /// TCP flag byte, zero for UDP
    pub flags: u8,
}

/// Parsed view of a datagram's addressing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub ip: Ipv4Header,
    pub transport: Option<TransportHeader>,
}

impl PacketInfo {
    pub fn is_tcp(&self) -> bool {
        self.ip.protocol == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.ip.protocol == IPPROTO_UDP
    }

    pub fn src_port(&self) -> Option<u16> {
        self.transport.map(|t| t.src_port)
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.transport.map(|t| t.dst_port)
    }

    pub fn source(&self) -> Option<SocketAddrV4> {
        self.transport
            .map(|t| SocketAddrV4::new(self.ip.src, t.src_port))
    }

    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.transport
            .map(|t| SocketAddrV4::new(self.ip.dst, t.dst_port))
    }

    /// Transport payload, empty when there is none.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        match self.transport {
            Some(t) if t.payload_offset <= self.ip.total_len.min(data.len()) => {
                &data[t.payload_offset..self.ip.total_len.min(data.len())]
            }
            _ => &[],
        }
    }
}

/// Parses the IPv4 header, rejecting anything that is not version 4 or is truncated.
pub fn parse_ipv4(data: &[u8]) -> Result<Ipv4Header> {
    let packet =
        Ipv4Packet::new(data).ok_or_else(|| Error::Packet("datagram shorter than 20 bytes".into()))?;

    if packet.get_version() != 4 {
        return Err(Error::Packet(format!(
            "unsupported IP version {}",
            packet.get_version()
        )));
    }

    let header_len = packet.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER || header_len > data.len() {
        return Err(Error::Packet(format!("bad IPv4 header length {}", header_len)));
    }

    let total_len = packet.get_total_length() as usize;
    if total_len < header_len || total_len > data.len() {
        return Err(Error::Packet(format!(
            "bad IPv4 total length {} (captured {})",
            total_len,
            data.len()
        )));
    }

    Ok(Ipv4Header {
        header_len,
        total_len,
        protocol: packet.get_next_level_protocol().0,
        src: packet.get_source(),
        dst: packet.get_destination(),
    })
}

pub fn parse_tcp(data: &[u8], ip: &Ipv4Header) -> Result<TransportHeader> {
    let segment = &data[ip.header_len..ip.total_len];
    let tcp = TcpPacket::new(segment)
        .ok_or_else(|| Error::Packet("TCP header truncated".into()))?;

    let header_len = tcp.get_data_offset() as usize * 4;
    if header_len < TCP_MIN_HEADER || header_len > segment.len() {
        return Err(Error::Packet(format!("bad TCP data offset {}", header_len)));
    }

    Ok(TransportHeader {
        protocol: IPPROTO_TCP,
        src_port: tcp.get_source(),
        dst_port: tcp.get_destination(),
        payload_offset: ip.header_len + header_len,
        flags: segment[13],
    })
}

pub fn parse_udp(data: &[u8], ip: &Ipv4Header) -> Result<TransportHeader> {
    let datagram = &data[ip.header_len..ip.total_len];
    let udp = UdpPacket::new(datagram)
        .ok_or_else(|| Error::Packet("UDP header truncated".into()))?;

    Ok(TransportHeader {
        protocol: IPPROTO_UDP,
        src_port: udp.get_source(),
        dst_port: udp.get_destination(),
        payload_offset: ip.header_len + UDP_HEADER,
        flags: 0,
    })
}

/// Parses the IPv4 header and, for TCP and UDP, the transport header.
///
/// # Examples
///
/// ```
/// use std::net::{Ipv4Addr, SocketAddrV4};
/// use packet_forge::packet::{build_tcp, inspect, TCP_SYN};
///
/// let client = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 51000);
/// let server = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
/// let packet = build_tcp(client, server, TCP_SYN, b"");
///
/// let info = inspect(&packet).unwrap();
/// assert_eq!(info.source(), Some(client));
/// assert_eq!(info.dst_port(), Some(80));
/// ```
pub fn inspect(data: &[u8]) -> Result<PacketInfo> {
    let ip = parse_ipv4(data)?;
    let transport = match ip.protocol {
        IPPROTO_TCP => Some(parse_tcp(data, &ip)?),
        IPPROTO_UDP => Some(parse_udp(data, &ip)?),
        _ => None,
    };
    Ok(PacketInfo { ip, transport })
}

/// Rewrites the source and/or destination of a TCP segment in place and
/// recomputes the IPv4 header and TCP checksums.
pub fn rewrite_tcp(
    data: &mut [u8],
    src: Option<SocketAddrV4>,
    dst: Option<SocketAddrV4>,
) -> Result<()> {
    let ip = parse_ipv4(data)?;
    if ip.protocol != IPPROTO_TCP {
        return Err(Error::Packet(format!("protocol {} is not TCP", ip.protocol)));
    }
    parse_tcp(data, &ip)?;

    let datagram = &mut data[..ip.total_len];
    let (new_src, new_dst) = {
        let mut header = MutableIpv4Packet::new(datagram)
            .ok_or_else(|| Error::Packet("datagram shorter than 20 bytes".into()))?;
        if let Some(addr) = src {
            header.set_source(*addr.ip());
        }
        if let Some(addr) = dst {
            header.set_destination(*addr.ip());
        }
        let checksum = ipv4::checksum(&header.to_immutable());
        header.set_checksum(checksum);
        (header.get_source(), header.get_destination())
    };

    let segment = &mut datagram[ip.header_len..];
    let mut tcp = MutableTcpPacket::new(segment)
        .ok_or_else(|| Error::Packet("TCP header truncated".into()))?;
    if let Some(addr) = src {
        tcp.set_source(addr.port());
    }
    if let Some(addr) = dst {
        tcp.set_destination(addr.port());
    }
    let checksum = tcp::ipv4_checksum(&tcp.to_immutable(), &new_src, &new_dst);
    tcp.set_checksum(checksum);

    trace!("Rewrote TCP segment {} -> {}", new_src, new_dst);
    Ok(())
}

/// One's-complement sum over 16-bit big-endian words, folded and inverted.
///
/// # Examples
///
/// ```
/// use packet_forge::packet::internet_checksum;
///
/// // A buffer with its own checksum appended sums to zero.
/// let data = [0x45, 0x00, 0x00, 0x1c];
/// let sum = internet_checksum(&data);
/// let mut with_sum = data.to_vec();
/// with_sum.extend_from_slice(&sum.to_be_bytes());
/// assert_eq!(internet_checksum(&with_sum), 0);
/// ```
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checks both the IPv4 header checksum and, for TCP, the segment checksum
/// including the pseudo-header.
pub fn checksums_valid(data: &[u8]) -> bool {
    let Ok(ip) = parse_ipv4(data) else {
        return false;
    };
    if internet_checksum(&data[..ip.header_len]) != 0 {
        return false;
    }
    if ip.protocol != IPPROTO_TCP {
        return true;
    }

    let segment = &data[ip.header_len..ip.total_len];
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&ip.src.octets());
    pseudo.extend_from_slice(&ip.dst.octets());
    pseudo.push(0);
    pseudo.push(IPPROTO_TCP);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    internet_checksum(&pseudo) == 0
}

/// Builds a checksummed IPv4/TCP datagram.
pub fn build_tcp(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + TCP_MIN_HEADER + payload.len();
    let mut buffer = vec![0u8; total];

    write_ipv4_header(&mut buffer, total, IPPROTO_TCP, *src.ip(), *dst.ip());
    {
        let segment = &mut buffer[IPV4_MIN_HEADER..];
        segment[13] = flags;
        if let Some(mut tcp) = MutableTcpPacket::new(segment) {
            tcp.set_source(src.port());
            tcp.set_destination(dst.port());
            tcp.set_sequence(1);
            tcp.set_data_offset(5);
            tcp.set_window(64240);
            tcp.set_payload(payload);
            let checksum = tcp::ipv4_checksum(&tcp.to_immutable(), src.ip(), dst.ip());
            tcp.set_checksum(checksum);
        }
    }
    buffer
}

/// Builds a checksummed IPv4/UDP datagram.
pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER + UDP_HEADER + payload.len();
    let mut buffer = vec![0u8; total];

    write_ipv4_header(&mut buffer, total, IPPROTO_UDP, *src.ip(), *dst.ip());
    if let Some(mut udp) = MutableUdpPacket::new(&mut buffer[IPV4_MIN_HEADER..]) {
        udp.set_source(src.port());
        udp.set_destination(dst.port());
        udp.set_length((UDP_HEADER + payload.len()) as u16);
        udp.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp.to_immutable(), src.ip(), dst.ip());
        udp.set_checksum(checksum);
    }
    buffer
}

fn write_ipv4_header(buffer: &mut [u8], total: usize, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    if let Some(mut ip) = MutableIpv4Packet::new(buffer) {
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_identification(0x1c46);
        ip.set_ttl(64);
        ip.set_next_level_protocol(if protocol == IPPROTO_TCP {
            IpNextHeaderProtocols::Tcp
        } else {
            IpNextHeaderProtocols::Udp
        });
        ip.set_source(src);
        ip.set_destination(dst);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
}
