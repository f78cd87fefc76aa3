// src/driver/pcap.rs

//! Capture driver on top of libpcap.
//!
//! libpcap can only copy packets, so divert handles are emulated: the packet
//! is read from the capture and the rewritten copy is sent through a raw IP
//! socket. Releasing an unmodified packet is a no-op. Packets this process
//! sent are fingerprinted so that when the capture sees them again they are
//! reported with the impostor flag.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use ::pcap::{Active, Capture, Device, Linktype};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::{transport_channel, TransportChannelType, TransportSender};
use pnet::util::MacAddr;

use super::datalink::find_interface;
use super::{CaptureDriver, CaptureHandle, CapturedPacket, Filter, OpenMode, PacketMeta};
use crate::error::{Error, Result};
use crate::packet;

const POLL_TIMEOUT_MS: i32 = 50;
const FINGERPRINT_CAPACITY: usize = 4096;
const ETHERTYPE_IPV4: u16 = 0x0800;

/// Remembers recently injected packets.
#[derive(Default)]
struct Fingerprints {
    order: VecDeque<u64>,
    set: HashSet<u64>,
}

impl Fingerprints {
    fn insert(&mut self, fp: u64) {
        if self.set.insert(fp) {
            self.order.push_back(fp);
            while self.order.len() > FINGERPRINT_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn take(&mut self, fp: u64) -> bool {
        if self.set.remove(&fp) {
            self.order.retain(|f| *f != fp);
            true
        } else {
            false
        }
    }
}

/// Hash over the parts of a datagram the kernel leaves alone on the way out
/// (addresses, protocol and the transport segment).
fn fingerprint(data: &[u8]) -> Option<u64> {
    let ip = packet::parse_ipv4(data).ok()?;
    let mut hasher = DefaultHasher::new();
    ip.protocol.hash(&mut hasher);
    ip.src.hash(&mut hasher);
    ip.dst.hash(&mut hasher);
    data[ip.header_len..ip.total_len].hash(&mut hasher);
    Some(hasher.finish())
}

pub struct PcapDriver {
    interface: String,
    local_mac: Option<MacAddr>,
    local_ips: Vec<Ipv4Addr>,
    injected: Arc<Mutex<Fingerprints>>,
    sender: Arc<Mutex<Option<TransportSender>>>,
}

impl PcapDriver {
    /// Prepares a driver for `interface`, failing when libpcap cannot see it.
    pub fn new(interface: &str) -> Result<Self> {
        let devices = Device::list()
            .map_err(|e| Error::DriverUnavailable(format!("Failed to list devices: {}", e)))?;
        if !devices.iter().any(|d| d.name == interface) {
            return Err(Error::DriverUnavailable(format!(
                "Interface {} not found",
                interface
            )));
        }

        let iface = find_interface(interface);
        let local_mac = iface.as_ref().and_then(|i| i.mac);
        let local_ips = iface
            .map(|i| {
                i.ips
                    .iter()
                    .filter_map(|net| match net.ip() {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(PcapDriver {
            interface: interface.to_string(),
            local_mac,
            local_ips,
            injected: Arc::new(Mutex::new(Fingerprints::default())),
            sender: Arc::new(Mutex::new(None)),
        })
    }

    fn device(&self) -> Result<Device> {
        Device::list()
            .map_err(|e| Error::DriverUnavailable(format!("Failed to list devices: {}", e)))?
            .into_iter()
            .find(|d| d.name == self.interface)
            .ok_or_else(|| Error::DriverUnavailable(format!("Interface {} not found", self.interface)))
    }
}

impl CaptureDriver for PcapDriver {
    fn name(&self) -> &str {
        "pcap"
    }

    fn can_withhold(&self) -> bool {
        false
    }

    fn open(&self, filter: &Filter, mode: OpenMode) -> Result<Arc<dyn CaptureHandle>> {
        let device = self.device()?;
        let loopback = device.flags.is_loopback();

        let mut cap = Capture::from_device(device)
            .map_err(|e| Error::DriverUnavailable(format!("Failed to create capture: {}", e)))?
            .promisc(true)
            .snaplen(65535)
            .timeout(POLL_TIMEOUT_MS)
            .immediate_mode(true)
            .open()
            .map_err(|e| Error::DriverUnavailable(format!("Failed to open capture: {}", e)))?;

        if let Some(bpf) = filter.to_bpf() {
            cap.filter(&bpf, true)
                .map_err(|e| Error::DriverUnavailable(format!("Failed to set filter: {}", e)))?;
            debug!("pcap filter on {}: {}", self.interface, bpf);
        }

        let linktype = cap.get_datalink();
        info!(
            "Opened {:?} handle on {} for [{}]",
            mode, self.interface, filter
        );

        Ok(Arc::new(PcapHandle {
            filter: filter.clone(),
            capture: Mutex::new(cap),
            linktype,
            loopback,
            local_mac: self.local_mac,
            local_ips: self.local_ips.clone(),
            injected: Arc::clone(&self.injected),
            sender: Arc::clone(&self.sender),
            closed: AtomicBool::new(false),
        }))
    }
}

struct PcapHandle {
    filter: Filter,
    capture: Mutex<Capture<Active>>,
    linktype: Linktype,
    loopback: bool,
    local_mac: Option<MacAddr>,
    local_ips: Vec<Ipv4Addr>,
    injected: Arc<Mutex<Fingerprints>>,
    sender: Arc<Mutex<Option<TransportSender>>>,
    closed: AtomicBool,
}

impl PcapHandle {
    /// Strips the link-layer header, returning the IPv4 datagram and whether
    /// the frame was sent by this host (when the link type tells).
    fn split_frame<'a>(&self, frame: &'a [u8]) -> Option<(&'a [u8], Option<bool>)> {
        let linktype = self.linktype;
        if linktype == Linktype::ETHERNET {
            if frame.len() < 14 {
                return None;
            }
            let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
            if ethertype != ETHERTYPE_IPV4 {
                return None;
            }
            let src = MacAddr::new(frame[6], frame[7], frame[8], frame[9], frame[10], frame[11]);
            Some((&frame[14..], self.local_mac.map(|mac| mac == src)))
        } else if linktype == Linktype::LINUX_SLL {
            if frame.len() < 16 {
                return None;
            }
            // packet type 4 = sent by us
            let outgoing = u16::from_be_bytes([frame[0], frame[1]]) == 4;
            Some((&frame[16..], Some(outgoing)))
        } else if linktype == Linktype::NULL || linktype == Linktype::LOOP {
            frame.get(4..).map(|d| (d, None))
        } else if linktype == Linktype::RAW || linktype == Linktype::IPV4 {
            Some((frame, None))
        } else {
            None
        }
    }
}

impl CaptureHandle for PcapHandle {
    fn recv(&self, timeout: Duration) -> Result<Option<CapturedPacket>> {
        let deadline = Instant::now() + timeout;
        let mut cap = self
            .capture
            .lock()
            .map_err(|_| Error::DriverUnavailable("capture poisoned".into()))?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::DriverUnavailable("handle closed".into()));
            }

            match cap.next_packet() {
                Ok(frame) => {
                    let Some((datagram, outgoing)) = self.split_frame(frame.data) else {
                        continue;
                    };
                    let Ok(ip) = packet::parse_ipv4(datagram) else {
                        trace!("Skipping non-IPv4 frame");
                        continue;
                    };
                    let datagram = &datagram[..ip.total_len];

                    let impostor = fingerprint(datagram).is_some_and(|fp| {
                        self.injected.lock().map(|mut f| f.take(fp)).unwrap_or(false)
                    });
                    let meta = PacketMeta {
                        outbound: outgoing.unwrap_or_else(|| self.local_ips.contains(&ip.src)),
                        loopback: self.loopback,
                        impostor,
                    };

                    if self.filter.matches(datagram, &meta) {
                        return Ok(Some(CapturedPacket {
                            data: datagram.to_vec(),
                            meta,
                        }));
                    }
                }
                Err(::pcap::Error::TimeoutExpired) => {}
                Err(e) => {
                    return Err(Error::DriverUnavailable(format!("Capture failed: {}", e)));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn send(&self, data: &[u8], meta: &PacketMeta) -> Result<()> {
        // the kernel still owns the original of anything we only copied
        if !meta.impostor {
            trace!("Released packet is already in flight");
            return Ok(());
        }
        let ip = packet::parse_ipv4(data)?;
        let datagram = &data[..ip.total_len];
        let packet = Ipv4Packet::new(datagram)
            .ok_or_else(|| Error::Packet("datagram shorter than 20 bytes".into()))?;

        let mut sender = self
            .sender
            .lock()
            .map_err(|_| Error::DriverUnavailable("raw sender poisoned".into()))?;
        if sender.is_none() {
            let (tx, _rx) = transport_channel(
                4096,
                TransportChannelType::Layer3(IpNextHeaderProtocols::Reserved),
            )
            .map_err(|e| Error::DriverUnavailable(format!("Failed to open raw socket: {}", e)))?;
            *sender = Some(tx);
        }

        if let (Some(fp), Ok(mut injected)) = (fingerprint(datagram), self.injected.lock()) {
            injected.insert(fp);
        }

        if let Some(tx) = sender.as_mut() {
            tx.send_to(packet, IpAddr::V4(ip.dst))?;
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
