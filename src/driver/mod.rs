// src/driver/mod.rs

//! Capture and injection capabilities.
//!
//! The packet-plane components are written against [`CaptureDriver`] (IP
//! datagrams, filtered by a [`Filter`] expression) and [`LinkLayer`] (raw
//! Ethernet frames). Implementations live in the submodules: `pcap`/`pnet`
//! backed ones for real interfaces and in-memory ones for tests.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use pnet::util::MacAddr;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::packet::{self, IPPROTO_TCP, IPPROTO_UDP};

pub mod datalink;
pub mod memory;
pub mod pcap;

pub use self::datalink::PnetLink;
pub use self::memory::{MemoryDriver, MemoryLink};
pub use self::pcap::PcapDriver;

/// Flags delivered with every captured packet and honoured on send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// The packet is leaving this host
    pub outbound: bool,
    /// The packet travels over a loopback interface
    pub loopback: bool,
    /// The packet was injected by this process
    pub impostor: bool,
}

impl PacketMeta {
    pub fn inbound() -> Self {
        PacketMeta::default()
    }

    pub fn outbound() -> Self {
        PacketMeta {
            outbound: true,
            ..PacketMeta::default()
        }
    }

    pub fn reinjected(outbound: bool) -> Self {
        PacketMeta {
            outbound,
            loopback: false,
            impostor: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub meta: PacketMeta,
}

/// Whether matching packets are taken out of the stack or merely copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Matching packets are withheld until the handle re-sends them
    Divert,
    /// Matching packets continue untouched; the handle sees copies
    Sniff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortField {
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
}

impl PortField {
    fn protocol(self) -> u8 {
        match self {
            PortField::TcpSrc | PortField::TcpDst => IPPROTO_TCP,
            PortField::UdpSrc | PortField::UdpDst => IPPROTO_UDP,
        }
    }

    fn is_source(self) -> bool {
        matches!(self, PortField::TcpSrc | PortField::UdpSrc)
    }

    fn expression_name(self) -> &'static str {
        match self {
            PortField::TcpSrc => "tcp.SrcPort",
            PortField::TcpDst => "tcp.DstPort",
            PortField::UdpSrc => "udp.SrcPort",
            PortField::UdpDst => "udp.DstPort",
        }
    }
}

/// Boolean filter expression over protocol, direction flags, addresses and ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    True,
    Ip,
    Tcp,
    Udp,
    Outbound,
    Loopback,
    Impostor,
    SrcAddr(Ipv4Addr),
    DstAddr(Ipv4Addr),
    Port(PortField, u16),
    PortRange(PortField, u16, u16),
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn not(inner: Filter) -> Filter {
        Filter::Not(Box::new(inner))
    }

    /// `src == ip or dst == ip` for each address.
    pub fn any_host(ips: &[Ipv4Addr]) -> Option<Filter> {
        let clauses: Vec<Filter> = ips
            .iter()
            .map(|ip| Filter::Or(vec![Filter::SrcAddr(*ip), Filter::DstAddr(*ip)]))
            .collect();
        match clauses.len() {
            0 => None,
            _ => Some(Filter::Or(clauses)),
        }
    }

    /// Evaluates the expression against a raw datagram and its flags.
    pub fn matches(&self, data: &[u8], meta: &PacketMeta) -> bool {
        let info = packet::inspect(data).ok();
        self.eval(info.as_ref(), meta)
    }

    fn eval(&self, info: Option<&packet::PacketInfo>, meta: &PacketMeta) -> bool {
        match self {
            Filter::True => true,
            Filter::Ip => info.is_some(),
            Filter::Tcp => info.is_some_and(|i| i.is_tcp()),
            Filter::Udp => info.is_some_and(|i| i.is_udp()),
            Filter::Outbound => meta.outbound,
            Filter::Loopback => meta.loopback,
            Filter::Impostor => meta.impostor,
            Filter::SrcAddr(ip) => info.is_some_and(|i| i.ip.src == *ip),
            Filter::DstAddr(ip) => info.is_some_and(|i| i.ip.dst == *ip),
            Filter::Port(field, port) => {
                port_of(info, *field).is_some_and(|p| p == *port)
            }
            Filter::PortRange(field, start, end) => {
                port_of(info, *field).is_some_and(|p| p >= *start && p <= *end)
            }
            Filter::Not(inner) => !inner.eval(info, meta),
            Filter::And(clauses) => clauses.iter().all(|c| c.eval(info, meta)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.eval(info, meta)),
        }
    }

    /// Best-effort translation to a BPF program string.
    ///
    /// Direction flags have no BPF equivalent; terms that cannot be expressed
    /// widen the result, and callers must post-filter with [`Filter::matches`].
    /// Returns `None` when nothing can be expressed.
    pub fn to_bpf(&self) -> Option<String> {
        match self {
            Filter::True => None,
            Filter::Ip => Some("ip".to_string()),
            Filter::Tcp => Some("tcp".to_string()),
            Filter::Udp => Some("udp".to_string()),
            Filter::Outbound | Filter::Loopback | Filter::Impostor => None,
            Filter::SrcAddr(ip) => Some(format!("src host {}", ip)),
            Filter::DstAddr(ip) => Some(format!("dst host {}", ip)),
            Filter::Port(field, port) => Some(format!("{} {}", bpf_port_prefix(*field), port)),
            Filter::PortRange(field, start, end) => Some(format!(
                "{} {}-{}",
                bpf_port_prefix(*field).replace("port", "portrange"),
                start,
                end
            )),
            // Negating a widened term would narrow it, so only exact terms
            // are negated.
            Filter::Not(inner) if inner.bpf_exact() => inner.to_bpf().map(|s| format!("not ({})", s)),
            Filter::Not(_) => None,
            Filter::And(clauses) => {
                let parts: Vec<String> = clauses.iter().filter_map(Filter::to_bpf).collect();
                match parts.len() {
                    0 => None,
                    1 => parts.into_iter().next(),
                    _ => Some(format!("({})", parts.join(" and "))),
                }
            }
            Filter::Or(clauses) => {
                let parts: Option<Vec<String>> = clauses.iter().map(Filter::to_bpf).collect();
                let parts = parts?;
                match parts.len() {
                    0 => None,
                    1 => parts.into_iter().next(),
                    _ => Some(format!("({})", parts.join(" or "))),
                }
            }
        }
    }
}

impl Filter {
    /// Whether [`Filter::to_bpf`] expresses this term without widening it.
    fn bpf_exact(&self) -> bool {
        match self {
            Filter::Outbound | Filter::Loopback | Filter::Impostor => false,
            Filter::Not(inner) => inner.bpf_exact(),
            Filter::And(clauses) | Filter::Or(clauses) => clauses.iter().all(Filter::bpf_exact),
            _ => true,
        }
    }
}

fn port_of(info: Option<&packet::PacketInfo>, field: PortField) -> Option<u16> {
    let info = info?;
    if info.ip.protocol != field.protocol() {
        return None;
    }
    if field.is_source() {
        info.src_port()
    } else {
        info.dst_port()
    }
}

fn bpf_port_prefix(field: PortField) -> &'static str {
    match field {
        PortField::TcpSrc => "tcp src port",
        PortField::TcpDst => "tcp dst port",
        PortField::UdpSrc => "udp src port",
        PortField::UdpDst => "udp dst port",
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::True => write!(f, "true"),
            Filter::Ip => write!(f, "ip"),
            Filter::Tcp => write!(f, "tcp"),
            Filter::Udp => write!(f, "udp"),
            Filter::Outbound => write!(f, "outbound"),
            Filter::Loopback => write!(f, "loopback"),
            Filter::Impostor => write!(f, "impostor"),
            Filter::SrcAddr(ip) => write!(f, "ip.SrcAddr == {}", ip),
            Filter::DstAddr(ip) => write!(f, "ip.DstAddr == {}", ip),
            Filter::Port(field, port) => write!(f, "{} == {}", field.expression_name(), port),
            Filter::PortRange(field, start, end) => write!(
                f,
                "({name} >= {} and {name} <= {})",
                start,
                end,
                name = field.expression_name()
            ),
            Filter::Not(inner) => match inner.as_ref() {
                Filter::Outbound
                | Filter::Loopback
                | Filter::Impostor
                | Filter::Ip
                | Filter::Tcp
                | Filter::Udp => write!(f, "!{}", inner),
                Filter::SrcAddr(ip) => write!(f, "ip.SrcAddr != {}", ip),
                Filter::DstAddr(ip) => write!(f, "ip.DstAddr != {}", ip),
                other => write!(f, "!({})", other),
            },
            Filter::And(clauses) => write_joined(f, clauses, " and "),
            Filter::Or(clauses) => write_joined(f, clauses, " or "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, clauses: &[Filter], sep: &str) -> fmt::Result {
    if clauses.is_empty() {
        return write!(f, "true");
    }
    if clauses.len() == 1 {
        return write!(f, "{}", clauses[0]);
    }
    write!(f, "(")?;
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", clause)?;
    }
    write!(f, ")")
}

/// A platform facility that can open filtered capture handles.
pub trait CaptureDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether divert handles really keep packets out of the stack. Drivers
    /// that only copy forward the original regardless of what we send.
    fn can_withhold(&self) -> bool {
        true
    }

    fn open(&self, filter: &Filter, mode: OpenMode) -> Result<Arc<dyn CaptureHandle>>;
}

/// One open filter. Receiving is blocking with a timeout; sending may be
/// called from any thread.
pub trait CaptureHandle: Send + Sync {
    /// Next matching packet, or `Ok(None)` when `timeout` elapses.
    fn recv(&self, timeout: Duration) -> Result<Option<CapturedPacket>>;

    fn send(&self, data: &[u8], meta: &PacketMeta) -> Result<()>;

    /// Unblocks pending receivers; subsequent receives fail.
    fn close(&self);
}

/// Opens link-layer injectors for an interface.
pub trait LinkLayer: Send + Sync {
    fn open(&self, interface: &str) -> Result<Arc<dyn LinkInjector>>;

    /// Hardware address of the interface, when it can be resolved.
    fn interface_mac(&self, interface: &str) -> Option<MacAddr>;
}

pub trait LinkInjector: Send + Sync {
    fn local_mac(&self) -> MacAddr;

    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

/// How long a reader thread blocks in [`CaptureHandle::recv`] before
/// checking whether anyone still listens.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Moves packets from a blocking capture handle onto an async channel.
///
/// The thread ends once the handle is closed or the receiving side of `tx`
/// is dropped.
pub fn spawn_reader<T, F>(
    name: &str,
    handle: Arc<dyn CaptureHandle>,
    tx: UnboundedSender<T>,
    wrap: F,
) -> io::Result<thread::JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(CapturedPacket) -> T + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("{}-reader", name))
        .spawn(move || {
            loop {
                match handle.recv(READ_POLL) {
                    Ok(Some(packet)) => {
                        if tx.send(wrap(packet)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        trace!("{} reader stopping: {}", label, e);
                        break;
                    }
                }
            }
            debug!("{} reader exited", label);
        })
}
