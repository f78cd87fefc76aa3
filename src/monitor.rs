// src/monitor.rs

//! Passive flow reconstruction.
//!
//! Packets to or from a target are folded into per-5-tuple flows. Flows are
//! labelled with the TLS server name from the first ClientHello, or with a
//! name learned from DNS answers, and are reported as session summaries when
//! they go idle or reach the maximum age.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, MissedTickBehavior};

use crate::dns::DnsTracker;
use crate::driver::{self, CaptureDriver, CaptureHandle, CapturedPacket, Filter, OpenMode, PacketMeta};
use crate::error::{Error, Result};
use crate::events::SessionRecorder;
use crate::packet::{self, IPPROTO_TCP, IPPROTO_UDP};
use crate::ports::PortSpec;
use crate::sni;
use crate::store::{SessionEntry, SessionSource};

pub const FLOW_IDLE_MS: u64 = 15_000;
pub const FLOW_MAX_MS: u64 = 60_000;
pub const OBSERVE_FLOW_IDLE_MS: u64 = 5_000;
pub const OBSERVE_FLOW_MAX_MS: u64 = 20_000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

const MIN_FLOW_IDLE_MS: u64 = 1_000;
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub targets: Vec<Ipv4Addr>,
    pub udp: bool,
    pub tcp: bool,
    /// Server ports owned by the redirector
    pub ignore_ports: PortSpec,
    pub local_ip: Option<Ipv4Addr>,
    pub proxy_port: Option<u16>,
    pub flow_idle_ms: u64,
    pub flow_max_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            targets: Vec::new(),
            udp: true,
            tcp: false,
            ignore_ports: PortSpec::empty(),
            local_ip: None,
            proxy_port: None,
            flow_idle_ms: FLOW_IDLE_MS,
            flow_max_ms: FLOW_MAX_MS,
        }
    }
}

impl MonitorConfig {
    /// Shorter timeouts, so HTTPS flows show up quickly when only their
    /// server names are observed.
    pub fn observe_https(mut self) -> Self {
        self.flow_idle_ms = OBSERVE_FLOW_IDLE_MS;
        self.flow_max_ms = OBSERVE_FLOW_MAX_MS;
        self
    }

    /// Idle timeout of at least one second and a max age no shorter than it.
    fn timeouts(&self) -> (Duration, Duration) {
        let idle = self.flow_idle_ms.max(MIN_FLOW_IDLE_MS);
        let max = self.flow_max_ms.max(idle);
        (Duration::from_millis(idle), Duration::from_millis(max))
    }

    /// `ip and (udp or tcp) and (target hosts)`.
    pub fn filter(&self) -> Result<Filter> {
        let mut protocols = Vec::new();
        if self.udp {
            protocols.push(Filter::Udp);
        }
        if self.tcp {
            protocols.push(Filter::Tcp);
        }
        let protocol = match protocols.len() {
            0 => return Err(Error::config("No protocols enabled for monitoring")),
            1 => protocols.remove(0),
            _ => Filter::Or(protocols),
        };
        let hosts = Filter::any_host(&self.targets)
            .ok_or_else(|| Error::config("No targets configured for monitoring"))?;
        Ok(Filter::And(vec![Filter::Ip, protocol, hosts]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => write!(f, "tcp"),
            FlowProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// The target is always the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub client: SocketAddrV4,
    pub server: SocketAddrV4,
}

#[derive(Debug, Clone)]
struct Flow {
    bytes: u64,
    packets: u64,
    first_seen: Instant,
    last_seen: Instant,
    tls_server_name: Option<String>,
    hello_checked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
    Idle,
    Rollover,
    Stop,
}

/// A reported slice of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub protocol: FlowProtocol,
    pub client: SocketAddrV4,
    pub server: SocketAddrV4,
    /// Server name from TLS or DNS, when known
    pub host: Option<String>,
    /// Set only when the name came from a ClientHello
    pub tls_server_name: Option<String>,
    pub size_bytes: u64,
    pub packets: u64,
    pub duration_ms: u64,
    pub reason: FlushReason,
}

impl FlowSummary {
    pub fn is_https(&self) -> bool {
        self.protocol == FlowProtocol::Tcp
            && (self.server.port() == HTTPS_PORT || self.tls_server_name.is_some())
    }

    /// `proto://host:port`, with `https` for TLS flows.
    pub fn url(&self) -> String {
        let scheme = if self.is_https() {
            "https".to_string()
        } else {
            self.protocol.to_string()
        };
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.server.ip().to_string());
        format!("{}://{}:{}", scheme, host, self.server.port())
    }
}

impl From<&FlowSummary> for SessionEntry {
    fn from(summary: &FlowSummary) -> Self {
        let (method, content_type) = if summary.is_https() {
            ("HTTPS".to_string(), "https".to_string())
        } else {
            (
                summary.protocol.to_string().to_uppercase(),
                summary.protocol.to_string(),
            )
        };
        SessionEntry {
            url: summary.url(),
            method,
            status: 0,
            content_type,
            size_bytes: summary.size_bytes,
            duration_ms: summary.duration_ms,
            source: SessionSource::Flow,
            ..SessionEntry::default()
        }
    }
}

/// The flow table and DNS cache of one monitor.
pub struct FlowTable {
    targets: Vec<Ipv4Addr>,
    udp: bool,
    tcp: bool,
    ignore_ports: PortSpec,
    proxy: Option<SocketAddrV4>,
    idle: Duration,
    max_age: Duration,
    flows: HashMap<FlowKey, Flow>,
    dns: DnsTracker,
    packets: u64,
}

impl FlowTable {
    pub fn new(config: &MonitorConfig) -> Self {
        let (idle, max_age) = config.timeouts();
        let proxy = match (config.local_ip, config.proxy_port) {
            (Some(ip), Some(port)) if port > 0 => Some(SocketAddrV4::new(ip, port)),
            _ => None,
        };
        FlowTable {
            targets: config.targets.clone(),
            udp: config.udp,
            tcp: config.tcp,
            ignore_ports: config.ignore_ports.clone(),
            proxy,
            idle,
            max_age,
            flows: HashMap::new(),
            dns: DnsTracker::new(),
            packets: 0,
        }
    }

    pub fn set_targets(&mut self, targets: Vec<Ipv4Addr>) {
        self.targets = targets;
    }

    pub fn targets(&self) -> &[Ipv4Addr] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn host_name(&self, ip: Ipv4Addr, now: Instant) -> Option<&str> {
        self.dns.lookup(ip, now)
    }

    /// Accounts one packet. Returns whether it landed in a flow.
    pub fn observe(&mut self, data: &[u8], meta: &PacketMeta, now: Instant) -> bool {
        if meta.loopback || meta.impostor {
            return false;
        }
        self.packets += 1;

        let Ok(info) = packet::inspect(data) else {
            return false;
        };
        let protocol = match info.ip.protocol {
            IPPROTO_UDP if self.udp => FlowProtocol::Udp,
            IPPROTO_TCP if self.tcp => FlowProtocol::Tcp,
            _ => return false,
        };
        let (Some(src), Some(dst)) = (info.source(), info.destination()) else {
            return false;
        };

        let outbound = self.targets.contains(src.ip());
        if !outbound && !self.targets.contains(dst.ip()) {
            return false;
        }

        let payload = info.payload(data);
        if protocol == FlowProtocol::Udp {
            self.dns
                .observe(*src.ip(), *dst.ip(), src.port(), dst.port(), payload, now);
        }

        let (client, server) = if outbound { (src, dst) } else { (dst, src) };
        if self.proxy == Some(server) {
            return false;
        }
        if self.ignore_ports.contains(server.port()) {
            return false;
        }

        let key = FlowKey {
            protocol,
            client,
            server,
        };
        let flow = self.flows.entry(key).or_insert_with(|| {
            trace!("New {} flow {} -> {}", protocol, client, server);
            Flow {
                bytes: 0,
                packets: 0,
                first_seen: now,
                last_seen: now,
                tls_server_name: None,
                hello_checked: false,
            }
        });
        flow.bytes += data.len() as u64;
        flow.packets += 1;
        flow.last_seen = now;

        // The ClientHello is the first payload the client sends
        if protocol == FlowProtocol::Tcp && outbound && !flow.hello_checked && !payload.is_empty() {
            flow.hello_checked = true;
            if let Some(name) = sni::extract_sni(payload) {
                debug!("TLS flow to {} is {}", server, name);
                self.dns.insert_name(*server.ip(), &name, now);
                flow.tls_server_name = Some(name);
            }
        }
        true
    }

    /// Flushes idle flows and rolls over old ones.
    pub fn sweep(&mut self, now: Instant) -> Vec<FlowSummary> {
        let mut out = Vec::new();
        let mut expired = Vec::new();

        for (key, flow) in self.flows.iter_mut() {
            if now.saturating_duration_since(flow.last_seen) >= self.idle {
                expired.push(*key);
                continue;
            }
            if now.saturating_duration_since(flow.first_seen) >= self.max_age {
                out.extend(summarize(&self.dns, key, flow, FlushReason::Rollover, now));
                flow.first_seen = now;
                flow.bytes = 0;
                flow.packets = 0;
            }
        }
        for key in expired {
            if let Some(flow) = self.flows.remove(&key) {
                out.extend(summarize(&self.dns, &key, &flow, FlushReason::Idle, now));
            }
        }

        self.dns.sweep(now);
        out
    }

    /// Flushes and forgets every flow.
    pub fn flush_all(&mut self, now: Instant) -> Vec<FlowSummary> {
        let out = self
            .flows
            .iter()
            .filter_map(|(key, flow)| summarize(&self.dns, key, flow, FlushReason::Stop, now))
            .collect();
        self.flows.clear();
        out
    }

    pub fn clear(&mut self) {
        self.flows.clear();
        self.dns.clear();
    }
}

fn summarize(
    dns: &DnsTracker,
    key: &FlowKey,
    flow: &Flow,
    reason: FlushReason,
    now: Instant,
) -> Option<FlowSummary> {
    if flow.bytes == 0 {
        return None;
    }
    let duration = flow.last_seen.saturating_duration_since(flow.first_seen);
    let host = flow
        .tls_server_name
        .clone()
        .or_else(|| dns.lookup(*key.server.ip(), now).map(str::to_string));
    Some(FlowSummary {
        protocol: key.protocol,
        client: key.client,
        server: key.server,
        host,
        tls_server_name: flow.tls_server_name.clone(),
        size_bytes: flow.bytes,
        packets: flow.packets,
        duration_ms: (duration.as_millis() as u64).max(1),
        reason,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub packets: u64,
    pub active_flows: usize,
    pub flushed: u64,
}

enum Command {
    SetTargets(Vec<Ipv4Addr>),
    Stop { flush: bool },
}

/// A running monitor: one sniff handle and one processing task.
pub struct FlowMonitor {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<MonitorStats>,
    task: JoinHandle<()>,
}

impl FlowMonitor {
    pub fn start(
        config: MonitorConfig,
        driver: Arc<dyn CaptureDriver>,
        recorder: SessionRecorder,
    ) -> Result<Self> {
        let filter = config.filter()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = open_sniffer(driver.as_ref(), &filter, &tx)?;
        info!(
            "Flow monitor started (udp: {}, tcp: {}, ignoring ports: {})",
            config.udp, config.tcp, config.ignore_ports
        );
        debug!("Monitor filter: {}", filter);

        let table = FlowTable::new(&config);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats) = watch::channel(MonitorStats::default());
        let task = tokio::spawn(run(
            Sniffer {
                driver,
                config,
                handle,
                tx,
            },
            table,
            rx,
            command_rx,
            stats_tx,
            recorder,
        ));

        Ok(FlowMonitor {
            commands,
            stats,
            task,
        })
    }

    /// Replaces the monitored target set.
    pub fn set_targets(&self, targets: Vec<Ipv4Addr>) -> Result<()> {
        self.commands
            .send(Command::SetTargets(targets))
            .map_err(|_| Error::state("Flow monitor is not running"))
    }

    pub fn stats(&self) -> MonitorStats {
        *self.stats.borrow()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Stops capturing. With `flush`, open flows are reported first.
    pub async fn stop(self, flush: bool) {
        let _ = self.commands.send(Command::Stop { flush });
        if let Err(e) = self.task.await {
            warn!("Flow monitor task ended abnormally: {}", e);
        }
        info!("Flow monitor stopped");
    }
}

struct Sniffer {
    driver: Arc<dyn CaptureDriver>,
    config: MonitorConfig,
    handle: Arc<dyn CaptureHandle>,
    tx: mpsc::UnboundedSender<CapturedPacket>,
}

impl Sniffer {
    /// Swaps the capture handle for one matching the new targets.
    fn retarget(&mut self, targets: Vec<Ipv4Addr>) -> Result<()> {
        let config = MonitorConfig {
            targets,
            ..self.config.clone()
        };
        let filter = config.filter()?;
        let handle = open_sniffer(self.driver.as_ref(), &filter, &self.tx)?;
        self.handle.close();
        self.handle = handle;
        self.config = config;
        Ok(())
    }
}

// Also runs when the task is aborted mid-loop.
impl Drop for Sniffer {
    fn drop(&mut self) {
        self.handle.close();
    }
}

fn open_sniffer(
    driver: &dyn CaptureDriver,
    filter: &Filter,
    tx: &mpsc::UnboundedSender<CapturedPacket>,
) -> Result<Arc<dyn CaptureHandle>> {
    let handle = driver.open(filter, OpenMode::Sniff)?;
    if let Err(e) = driver::spawn_reader("monitor", Arc::clone(&handle), tx.clone(), |p| p) {
        handle.close();
        return Err(e.into());
    }
    Ok(handle)
}

async fn run(
    mut sniffer: Sniffer,
    mut table: FlowTable,
    mut packets: mpsc::UnboundedReceiver<CapturedPacket>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stats: watch::Sender<MonitorStats>,
    recorder: SessionRecorder,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flushed = 0u64;

    let flush_on_stop = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::SetTargets(targets)) => {
                    match sniffer.retarget(targets.clone()) {
                        Ok(()) => {
                            info!("Flow monitor now watching {} targets", targets.len());
                            table.set_targets(targets);
                        }
                        Err(e) => warn!("Failed to update monitored targets: {}", e),
                    }
                }
                Some(Command::Stop { flush }) => break flush,
                None => break false,
            },
            Some(captured) = packets.recv() => {
                table.observe(&captured.data, &captured.meta, Instant::now());
            }
            _ = ticker.tick() => {
                flushed += emit(&recorder, table.sweep(Instant::now()));
            }
        }
        stats.send_replace(MonitorStats {
            packets: table.packets(),
            active_flows: table.len(),
            flushed,
        });
    };

    drop(sniffer);
    if flush_on_stop {
        emit(&recorder, table.flush_all(Instant::now()));
    }
    table.clear();
}

fn emit(recorder: &SessionRecorder, summaries: Vec<FlowSummary>) -> u64 {
    let count = summaries.len() as u64;
    for summary in summaries {
        trace!(
            "Flow {} ({:?}, {} bytes)",
            summary.url(),
            summary.reason,
            summary.size_bytes
        );
        recorder.record(SessionEntry::from(&summary));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::packet::{build_tcp, build_udp, TCP_ACK, TCP_PSH, TCP_SYN};
    use crate::store::MemoryStore;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn sock(ip: Ipv4Addr, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(ip, port)
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            targets: vec![TARGET],
            tcp: true,
            ignore_ports: PortSpec::parse("80"),
            local_ip: Some(Ipv4Addr::new(192, 168, 1, 5)),
            proxy_port: Some(8888),
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_filter() {
        assert_eq!(
            config().filter().unwrap().to_string(),
            "(ip and (udp or tcp) and (ip.SrcAddr == 192.168.1.20 or ip.DstAddr == 192.168.1.20))"
        );
        let none = MonitorConfig {
            udp: false,
            ..MonitorConfig::default()
        };
        assert!(none.filter().is_err());
        assert!(MonitorConfig::default().filter().is_err());
    }

    #[test]
    fn test_flow_direction_and_ignores() {
        let mut table = FlowTable::new(&config());
        let now = Instant::now();
        let server = sock(Ipv4Addr::new(1, 1, 1, 1), 22);
        let client = sock(TARGET, 40000);

        assert!(table.observe(&build_tcp(client, server, TCP_SYN, b""), &PacketMeta::outbound(), now));
        assert!(table.observe(&build_tcp(server, client, TCP_SYN | TCP_ACK, b""), &PacketMeta::inbound(), now));
        assert_eq!(table.len(), 1);

        // redirected port, proxy traffic, injected copies and strangers are skipped
        let web = sock(Ipv4Addr::new(1, 1, 1, 1), 80);
        assert!(!table.observe(&build_tcp(client, web, TCP_SYN, b""), &PacketMeta::outbound(), now));
        let proxy = sock(Ipv4Addr::new(192, 168, 1, 5), 8888);
        assert!(!table.observe(&build_tcp(proxy, client, TCP_ACK, b""), &PacketMeta::inbound(), now));
        assert!(!table.observe(&build_tcp(client, server, TCP_ACK, b""), &PacketMeta::reinjected(true), now));
        let stranger = sock(Ipv4Addr::new(192, 168, 1, 99), 5000);
        assert!(!table.observe(&build_tcp(stranger, server, TCP_SYN, b""), &PacketMeta::outbound(), now));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_idle_and_rollover() {
        let cfg = MonitorConfig {
            flow_idle_ms: 2_000,
            flow_max_ms: 5_000,
            ..config()
        };
        let mut table = FlowTable::new(&cfg);
        let start = Instant::now();
        let client = sock(TARGET, 40000);
        let busy = sock(Ipv4Addr::new(1, 1, 1, 1), 22);
        let quiet = sock(Ipv4Addr::new(2, 2, 2, 2), 22);

        table.observe(&build_tcp(client, quiet, TCP_SYN, b""), &PacketMeta::outbound(), start);
        for second in 0..6 {
            let at = start + Duration::from_secs(second);
            table.observe(&build_tcp(client, busy, TCP_ACK, b"x"), &PacketMeta::outbound(), at);
        }

        let flushed = table.sweep(start + Duration::from_millis(5_500));
        assert_eq!(flushed.len(), 2);
        let idle = flushed.iter().find(|s| s.reason == FlushReason::Idle).unwrap();
        assert_eq!(idle.server, quiet);
        let rolled = flushed.iter().find(|s| s.reason == FlushReason::Rollover).unwrap();
        assert_eq!(rolled.server, busy);
        assert_eq!(rolled.packets, 6);

        // the rolled-over flow stays open with fresh counters
        assert_eq!(table.len(), 1);
        assert!(table.sweep(start + Duration::from_millis(5_600)).is_empty());
        table.observe(&build_tcp(client, busy, TCP_ACK, b"x"), &PacketMeta::outbound(), start + Duration::from_secs(6));
        let last = table.flush_all(start + Duration::from_secs(6));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].packets, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sni_labels_flow() {
        let mut table = FlowTable::new(&config());
        let now = Instant::now();
        let client = sock(TARGET, 40001);
        let server = sock(Ipv4Addr::new(93, 184, 216, 34), 8443);

        table.observe(&build_tcp(client, server, TCP_SYN, b""), &PacketMeta::outbound(), now);
        let hello = sni::client_hello("secure.example.com");
        table.observe(&build_tcp(client, server, TCP_PSH | TCP_ACK, &hello), &PacketMeta::outbound(), now);
        assert_eq!(table.host_name(*server.ip(), now), Some("secure.example.com"));

        let summary = table.flush_all(now).pop().unwrap();
        assert!(summary.is_https());
        assert_eq!(summary.url(), "https://secure.example.com:8443");
        let entry = SessionEntry::from(&summary);
        assert_eq!(entry.method, "HTTPS");
        assert_eq!(entry.content_type, "https");
        assert_eq!(entry.source, SessionSource::Flow);
    }

    #[test]
    fn test_dns_names_udp_flows() {
        let mut table = FlowTable::new(&config());
        let now = Instant::now();
        let client = sock(TARGET, 53000);
        let resolver = sock(Ipv4Addr::new(8, 8, 8, 8), 53);
        let answer = Ipv4Addr::new(151, 101, 1, 69);

        table.observe(&build_udp(client, resolver, &crate::dns::tests::query(7, "cdn.example.org")), &PacketMeta::outbound(), now);
        table.observe(&build_udp(resolver, client, &crate::dns::tests::response(7, "cdn.example.org", answer)), &PacketMeta::inbound(), now);
        table.observe(&build_udp(client, sock(answer, 3478), b"stun"), &PacketMeta::outbound(), now);

        let summaries = table.flush_all(now);
        let media = summaries.iter().find(|s| s.server.port() == 3478).unwrap();
        assert_eq!(media.url(), "udp://cdn.example.org:3478");
        let entry = SessionEntry::from(media);
        assert_eq!(entry.method, "UDP");
        assert_eq!(entry.content_type, "udp");

        let dns = summaries.iter().find(|s| s.server.port() == 53).unwrap();
        assert_eq!(dns.url(), "udp://8.8.8.8:53");
    }

    #[test]
    fn test_plain_tcp_to_443_is_https() {
        let summary = FlowSummary {
            protocol: FlowProtocol::Tcp,
            client: sock(TARGET, 1),
            server: sock(Ipv4Addr::new(1, 2, 3, 4), 443),
            host: None,
            tls_server_name: None,
            size_bytes: 10,
            packets: 1,
            duration_ms: 1,
            reason: FlushReason::Idle,
        };
        assert_eq!(summary.url(), "https://1.2.3.4:443");
    }

    #[tokio::test]
    async fn test_monitor_records_on_stop() {
        let driver = MemoryDriver::new();
        let store = Arc::new(MemoryStore::new());
        let monitor = FlowMonitor::start(
            config(),
            Arc::new(driver.clone()),
            SessionRecorder::new(store.clone()),
        )
        .unwrap();

        let client = sock(TARGET, 40000);
        let server = sock(Ipv4Addr::new(1, 1, 1, 1), 22);
        assert_eq!(driver.inject(&build_tcp(client, server, TCP_SYN, b""), PacketMeta::outbound()), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.stats().active_flows == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.stats().active_flows, 1);

        monitor.stop(true).await;
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entry.url, "tcp://1.1.1.1:22");
        assert_eq!(driver.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_flush_records_nothing() {
        let driver = MemoryDriver::new();
        let store = Arc::new(MemoryStore::new());
        let monitor = FlowMonitor::start(
            config(),
            Arc::new(driver.clone()),
            SessionRecorder::new(store.clone()),
        )
        .unwrap();
        driver.inject(
            &build_tcp(sock(TARGET, 1), sock(Ipv4Addr::new(1, 1, 1, 1), 22), TCP_SYN, b""),
            PacketMeta::outbound(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop(false).await;
        assert!(store.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_set_targets_reopens_capture() {
        let driver = MemoryDriver::new();
        let store = Arc::new(MemoryStore::new());
        let monitor = FlowMonitor::start(
            config(),
            Arc::new(driver.clone()),
            SessionRecorder::new(store),
        )
        .unwrap();

        let other = Ipv4Addr::new(192, 168, 1, 30);
        monitor.set_targets(vec![TARGET, other]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.opened_filters().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let filters = driver.opened_filters();
        assert_eq!(filters.len(), 2);
        assert!(filters[1].0.to_string().contains("192.168.1.30"));
        assert_eq!(driver.open_handles(), 1);

        monitor.stop(false).await;
    }
}
