// src/redirect.rs

//! NAT-style redirection of victim traffic to the local proxy.
//!
//! Two divert handles are used. The forward handle takes victim packets bound
//! for an intercepted port and points them at the proxy, remembering the real
//! server per client address. The response handle takes the proxy's replies
//! and puts the real server back as their source, so the victim never sees
//! the proxy.
//!
//! [`RedirectEngine`] holds all of the logic and is driven synchronously;
//! [`Redirector`] wires it to a capture driver.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, MissedTickBehavior};

use crate::driver::{
    self, CaptureDriver, CaptureHandle, CapturedPacket, Filter, OpenMode, PacketMeta, PortField,
};
use crate::error::{Error, Result};
use crate::os::NetworkConfigurator;
use crate::packet;
use crate::ports::PortSpec;

pub const CONNECTION_TTL: Duration = Duration::from_secs(5 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Progress is logged once per this many redirected packets.
const LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Destination ports to intercept
    pub ports: PortSpec,
    pub proxy_port: u16,
    /// Only packets from these sources are redirected; empty means any
    pub targets: Vec<Ipv4Addr>,
    /// Address the proxy listens on. Loopback when unknown.
    pub local_ip: Option<Ipv4Addr>,
    pub connection_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            ports: PortSpec::parse("80,443"),
            proxy_port: 8888,
            targets: Vec::new(),
            local_ip: None,
            connection_ttl_secs: CONNECTION_TTL.as_secs(),
            sweep_interval_secs: SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// What to do with a diverted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The buffer was rewritten; send it with the impostor flag
    Reinject,
    /// Release the packet unchanged
    Pass,
    Drop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectStats {
    pub packets: u64,
    pub redirected: u64,
    pub responses: u64,
    pub dropped: u64,
    pub connections: usize,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    server: SocketAddrV4,
    last_seen: Instant,
}

/// Connection tracking and header rewriting, without any I/O.
pub struct RedirectEngine {
    ports: PortSpec,
    proxy: SocketAddrV4,
    targets: Vec<Ipv4Addr>,
    local_ip: Option<Ipv4Addr>,
    ttl: Duration,
    connections: HashMap<SocketAddrV4, Mapping>,
    stats: RedirectStats,
}

impl RedirectEngine {
    pub fn new(config: &RedirectConfig) -> Result<Self> {
        if config.ports.is_empty() {
            return Err(Error::config("No redirect ports configured"));
        }
        if config.ports.is_all() {
            return Err(Error::config(
                "Refusing to redirect every port; wildcard specs are observed only",
            ));
        }

        let proxy_ip = config.local_ip.unwrap_or(Ipv4Addr::LOCALHOST);
        Ok(RedirectEngine {
            ports: config.ports.clone(),
            proxy: SocketAddrV4::new(proxy_ip, config.proxy_port),
            targets: config.targets.clone(),
            local_ip: config.local_ip,
            ttl: Duration::from_secs(config.connection_ttl_secs),
            connections: HashMap::new(),
            stats: RedirectStats::default(),
        })
    }

    pub fn proxy_addr(&self) -> SocketAddrV4 {
        self.proxy
    }

    /// Victim packets bound for an intercepted port that we did not inject
    /// ourselves and that do not originate from this host.
    pub fn forward_filter(&self) -> Filter {
        let mut clauses = vec![
            Filter::not(Filter::Impostor),
            Filter::not(Filter::Loopback),
            Filter::Tcp,
        ];
        clauses.extend(self.ports.to_filter(PortField::TcpDst));
        if !self.targets.is_empty() {
            let sources: Vec<Filter> = self.targets.iter().map(|ip| Filter::SrcAddr(*ip)).collect();
            clauses.push(Filter::Or(sources));
        }
        if let Some(local) = self.local_ip {
            clauses.push(Filter::not(Filter::SrcAddr(local)));
        }
        Filter::And(clauses)
    }

    /// The proxy's outgoing replies.
    pub fn response_filter(&self) -> Filter {
        let mut clauses = vec![
            Filter::Outbound,
            Filter::not(Filter::Loopback),
            Filter::not(Filter::Impostor),
            Filter::Port(PortField::TcpSrc, self.proxy.port()),
        ];
        if let Some(local) = self.local_ip {
            clauses.push(Filter::SrcAddr(local));
        }
        Filter::And(clauses)
    }

    /// Points a victim packet at the proxy and remembers where it was going.
    pub fn handle_forward(&mut self, data: &mut [u8], meta: &PacketMeta, now: Instant) -> Verdict {
        if meta.loopback || meta.impostor {
            return Verdict::Pass;
        }
        self.stats.packets += 1;

        let info = match packet::inspect(data) {
            Ok(info) => info,
            Err(e) => {
                trace!("Dropping unparsable forward packet: {}", e);
                self.stats.dropped += 1;
                return Verdict::Drop;
            }
        };
        let (Some(client), Some(server)) = (info.source(), info.destination()) else {
            return Verdict::Pass;
        };
        if !info.is_tcp() || !self.ports.contains(server.port()) {
            return Verdict::Pass;
        }

        if let Err(e) = packet::rewrite_tcp(data, None, Some(self.proxy)) {
            debug!("Failed to redirect {} -> {}: {}", client, server, e);
            self.stats.dropped += 1;
            return Verdict::Drop;
        }
        self.connections.insert(
            client,
            Mapping {
                server,
                last_seen: now,
            },
        );

        self.stats.redirected += 1;
        if self.stats.redirected % LOG_EVERY == 0 {
            info!(
                "Redirected {} packets ({} tracked connections)",
                self.stats.redirected,
                self.connections.len()
            );
        }
        trace!("Redirected {} -> {} via {}", client, server, self.proxy);
        Verdict::Reinject
    }

    /// Restores the real server as the source of a proxy reply.
    pub fn handle_response(&mut self, data: &mut [u8], meta: &PacketMeta, now: Instant) -> Verdict {
        if meta.loopback || meta.impostor {
            return Verdict::Pass;
        }

        let info = match packet::inspect(data) {
            Ok(info) => info,
            Err(e) => {
                trace!("Dropping unparsable response packet: {}", e);
                self.stats.dropped += 1;
                return Verdict::Drop;
            }
        };
        let Some(client) = info.destination() else {
            return Verdict::Pass;
        };
        let Some(mapping) = self.connections.get_mut(&client) else {
            trace!("No tracked connection for {}", client);
            return Verdict::Pass;
        };
        mapping.last_seen = now;
        let server = mapping.server;

        if let Err(e) = packet::rewrite_tcp(data, Some(server), None) {
            debug!("Failed to restore source {} for {}: {}", server, client, e);
            self.stats.dropped += 1;
            return Verdict::Drop;
        }
        self.stats.responses += 1;
        Verdict::Reinject
    }

    /// Original destination of the connection from `client`, if tracked.
    pub fn original_destination(&self, client: SocketAddrV4) -> Option<SocketAddrV4> {
        self.connections.get(&client).map(|m| m.server)
    }

    /// Forgets connections idle for at least the TTL. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.connections.len();
        self.connections
            .retain(|_, m| now.saturating_duration_since(m.last_seen) < ttl);
        let removed = before - self.connections.len();
        if removed > 0 {
            debug!("Swept {} stale connections", removed);
        }
        removed
    }

    pub fn stats(&self) -> RedirectStats {
        RedirectStats {
            connections: self.connections.len(),
            ..self.stats
        }
    }
}

/// Which backend a running [`Redirector`] ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RedirectMode {
    /// Packet rewriting through the capture driver
    Driver,
    /// OS port-forward rules; the original destination is lost
    PortForward,
}

enum Backend {
    Driver {
        handles: Vec<Arc<dyn CaptureHandle>>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
    PortForward {
        os: Arc<dyn NetworkConfigurator>,
        ports: Vec<u16>,
        proxy_port: u16,
    },
}

enum Input {
    Forward(CapturedPacket),
    Response(CapturedPacket),
}

pub struct Redirector {
    mode: RedirectMode,
    proxy: SocketAddrV4,
    stats: watch::Receiver<RedirectStats>,
    backend: Backend,
}

impl Redirector {
    /// Starts redirecting through `driver`, or through OS port forwarding
    /// when no driver is given or its handles cannot be opened.
    pub async fn start(
        config: RedirectConfig,
        driver: Option<Arc<dyn CaptureDriver>>,
        os: Arc<dyn NetworkConfigurator>,
    ) -> Result<Self> {
        let engine = RedirectEngine::new(&config)?;
        let proxy = engine.proxy_addr();

        if let Some(driver) = driver {
            match Self::start_driver(engine, driver.as_ref(), &config) {
                Ok((backend, stats)) => {
                    info!(
                        "Redirecting ports {} to {} through {}",
                        config.ports,
                        proxy,
                        driver.name()
                    );
                    return Ok(Redirector {
                        mode: RedirectMode::Driver,
                        proxy,
                        stats,
                        backend,
                    });
                }
                Err(e) => warn!(
                    "Capture driver unavailable for redirection ({}), falling back to port forwarding",
                    e
                ),
            }
        } else {
            warn!("No capture driver, falling back to port forwarding");
        }

        let ports = config.ports.expand().map_err(Error::Config)?;
        let mut added = Vec::with_capacity(ports.len());
        for port in ports {
            if let Err(e) = os.add_port_forward(port, config.proxy_port).await {
                for done in added {
                    let _ = os.remove_port_forward(done, config.proxy_port).await;
                }
                return Err(e);
            }
            added.push(port);
        }
        warn!(
            "Port forwarding {} to local port {}; original destinations are not preserved",
            config.ports, config.proxy_port
        );

        let (_, stats) = watch::channel(RedirectStats::default());
        Ok(Redirector {
            mode: RedirectMode::PortForward,
            proxy,
            stats,
            backend: Backend::PortForward {
                os,
                ports: added,
                proxy_port: config.proxy_port,
            },
        })
    }

    fn start_driver(
        engine: RedirectEngine,
        driver: &dyn CaptureDriver,
        config: &RedirectConfig,
    ) -> Result<(Backend, watch::Receiver<RedirectStats>)> {
        let forward_filter = engine.forward_filter();
        let response_filter = engine.response_filter();
        debug!("Forward filter: {}", forward_filter);
        debug!("Response filter: {}", response_filter);

        let forward = driver.open(&forward_filter, OpenMode::Divert)?;
        let response = match driver.open(&response_filter, OpenMode::Divert) {
            Ok(handle) => handle,
            Err(e) => {
                forward.close();
                return Err(e);
            }
        };
        let handles = vec![Arc::clone(&forward), Arc::clone(&response)];
        let close_all = |handles: &[Arc<dyn CaptureHandle>]| handles.iter().for_each(|h| h.close());

        let (tx, rx) = mpsc::unbounded_channel();
        let readers = driver::spawn_reader(
            "redirect-forward",
            Arc::clone(&forward),
            tx.clone(),
            Input::Forward,
        )
        .and_then(|_| {
            driver::spawn_reader("redirect-response", Arc::clone(&response), tx, Input::Response)
        });
        if let Err(e) = readers {
            close_all(&handles);
            return Err(e.into());
        }

        let (stats_tx, stats_rx) = watch::channel(engine.stats());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweep = Duration::from_secs(config.sweep_interval_secs.max(1));
        let task = tokio::spawn(run(
            engine,
            forward,
            response,
            rx,
            shutdown_rx,
            stats_tx,
            sweep,
        ));

        Ok((
            Backend::Driver {
                handles,
                shutdown,
                task,
            },
            stats_rx,
        ))
    }

    pub fn mode(&self) -> RedirectMode {
        self.mode
    }

    pub fn proxy_addr(&self) -> SocketAddrV4 {
        self.proxy
    }

    pub fn stats(&self) -> RedirectStats {
        *self.stats.borrow()
    }

    /// The packet task, when redirecting through the driver.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        match &self.backend {
            Backend::Driver { task, .. } => Some(task.abort_handle()),
            Backend::PortForward { .. } => None,
        }
    }

    pub async fn stop(self) {
        match self.backend {
            Backend::Driver {
                handles,
                shutdown,
                task,
            } => {
                let _ = shutdown.send(true);
                for handle in &handles {
                    handle.close();
                }
                if let Err(e) = task.await {
                    warn!("Redirector task ended abnormally: {}", e);
                }
            }
            Backend::PortForward {
                os,
                ports,
                proxy_port,
            } => {
                for port in ports {
                    if let Err(e) = os.remove_port_forward(port, proxy_port).await {
                        warn!("Failed to remove port forward for {}: {}", port, e);
                    }
                }
            }
        }
        info!("Redirection stopped");
    }
}

async fn run(
    mut engine: RedirectEngine,
    forward: Arc<dyn CaptureHandle>,
    response: Arc<dyn CaptureHandle>,
    mut packets: mpsc::UnboundedReceiver<Input>,
    mut shutdown: watch::Receiver<bool>,
    stats: watch::Sender<RedirectStats>,
    sweep: Duration,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + sweep, sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                engine.sweep(Instant::now());
                stats.send_replace(engine.stats());
            }
            input = packets.recv() => {
                let Some(input) = input else { break };
                let (handle, captured, outbound, verdict) = match input {
                    Input::Forward(mut p) => {
                        let v = engine.handle_forward(&mut p.data, &p.meta, Instant::now());
                        (&forward, p, false, v)
                    }
                    Input::Response(mut p) => {
                        let v = engine.handle_response(&mut p.data, &p.meta, Instant::now());
                        (&response, p, true, v)
                    }
                };
                let sent = match verdict {
                    Verdict::Reinject => handle.send(&captured.data, &PacketMeta::reinjected(outbound)),
                    Verdict::Pass => handle.send(&captured.data, &captured.meta),
                    Verdict::Drop => Ok(()),
                };
                if let Err(e) = sent {
                    debug!("Failed to re-inject packet: {}", e);
                }
                stats.send_replace(engine.stats());
            }
        }
    }
    debug!("Redirect loop finished: {:?}", engine.stats());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::os::RecordingNetwork;
    use crate::packet::{build_tcp, checksums_valid, inspect, TCP_ACK, TCP_SYN};
    use pnet::util::MacAddr;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 5);

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 51000)
    }

    fn server() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    fn config() -> RedirectConfig {
        RedirectConfig {
            ports: PortSpec::parse("80,443"),
            targets: vec![*client().ip()],
            local_ip: Some(LOCAL),
            ..RedirectConfig::default()
        }
    }

    fn os() -> Arc<RecordingNetwork> {
        Arc::new(RecordingNetwork::new(LOCAL, MacAddr::new(2, 0, 0, 0, 0, 5)))
    }

    #[test]
    fn test_filters() {
        let engine = RedirectEngine::new(&config()).unwrap();
        assert_eq!(
            engine.forward_filter().to_string(),
            "(!impostor and !loopback and tcp and (tcp.DstPort == 80 or tcp.DstPort == 443) \
             and ip.SrcAddr == 192.168.1.20 and ip.SrcAddr != 192.168.1.5)"
        );
        assert_eq!(
            engine.response_filter().to_string(),
            "(outbound and !loopback and !impostor and tcp.SrcPort == 8888 and ip.SrcAddr == 192.168.1.5)"
        );
    }

    #[test]
    fn test_proxy_defaults_to_loopback() {
        let engine = RedirectEngine::new(&RedirectConfig::default()).unwrap();
        assert_eq!(engine.proxy_addr(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8888));
        assert!(!engine.response_filter().to_string().contains("SrcAddr"));
    }

    #[test]
    fn test_rejects_empty_and_wildcard_ports() {
        let empty = RedirectConfig {
            ports: PortSpec::empty(),
            ..config()
        };
        let err = RedirectEngine::new(&empty).err().unwrap();
        assert!(err.to_string().contains("No redirect ports configured"));

        let all = RedirectConfig {
            ports: PortSpec::all(),
            ..config()
        };
        assert!(RedirectEngine::new(&all).is_err());
    }

    #[test]
    fn test_forward_then_response_restores_server() {
        let mut engine = RedirectEngine::new(&config()).unwrap();
        let now = Instant::now();

        let mut syn = build_tcp(client(), server(), TCP_SYN, b"");
        assert_eq!(
            engine.handle_forward(&mut syn, &PacketMeta::inbound(), now),
            Verdict::Reinject
        );
        let info = inspect(&syn).unwrap();
        assert_eq!(info.source(), Some(client()));
        assert_eq!(info.destination(), Some(SocketAddrV4::new(LOCAL, 8888)));
        assert!(checksums_valid(&syn));
        assert_eq!(engine.original_destination(client()), Some(server()));

        let proxy = SocketAddrV4::new(LOCAL, 8888);
        let mut reply = build_tcp(proxy, client(), TCP_SYN | TCP_ACK, b"");
        assert_eq!(
            engine.handle_response(&mut reply, &PacketMeta::outbound(), now),
            Verdict::Reinject
        );
        let info = inspect(&reply).unwrap();
        assert_eq!(info.source(), Some(server()));
        assert_eq!(info.destination(), Some(client()));
        assert!(checksums_valid(&reply));

        let stats = engine.stats();
        assert_eq!(stats.redirected, 1);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn test_passes_and_drops() {
        let mut engine = RedirectEngine::new(&config()).unwrap();
        let now = Instant::now();

        let mut other_port = build_tcp(client(), SocketAddrV4::new(*server().ip(), 22), TCP_SYN, b"");
        assert_eq!(
            engine.handle_forward(&mut other_port, &PacketMeta::inbound(), now),
            Verdict::Pass
        );

        let mut ours = build_tcp(client(), server(), TCP_SYN, b"");
        assert_eq!(
            engine.handle_forward(&mut ours, &PacketMeta::reinjected(false), now),
            Verdict::Pass
        );

        let mut unknown = build_tcp(SocketAddrV4::new(LOCAL, 8888), client(), TCP_ACK, b"");
        assert_eq!(
            engine.handle_response(&mut unknown, &PacketMeta::outbound(), now),
            Verdict::Pass
        );

        let mut garbage = vec![0x60, 0, 0, 0];
        assert_eq!(
            engine.handle_forward(&mut garbage, &PacketMeta::inbound(), now),
            Verdict::Drop
        );
        assert_eq!(engine.stats().dropped, 1);
        assert_eq!(engine.stats().redirected, 0);
    }

    #[test]
    fn test_sweep_evicts_idle_connections() {
        let mut engine = RedirectEngine::new(&config()).unwrap();
        let start = Instant::now();
        let mut syn = build_tcp(client(), server(), TCP_SYN, b"");
        engine.handle_forward(&mut syn, &PacketMeta::inbound(), start);

        assert_eq!(engine.sweep(start + Duration::from_secs(60)), 0);
        assert_eq!(engine.sweep(start + CONNECTION_TTL), 1);
        assert_eq!(engine.original_destination(client()), None);
    }

    #[tokio::test]
    async fn test_redirector_with_memory_driver() {
        let driver = MemoryDriver::new();
        let redirector = Redirector::start(config(), Some(Arc::new(driver.clone())), os())
            .await
            .unwrap();
        assert_eq!(redirector.mode(), RedirectMode::Driver);
        assert_eq!(driver.open_handles(), 2);

        let syn = build_tcp(client(), server(), TCP_SYN, b"");
        assert_eq!(driver.inject(&syn, PacketMeta::inbound()), 1);
        let sent = driver.wait_sent(1, Duration::from_secs(2)).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].meta.impostor);
        assert_eq!(
            inspect(&sent[0].data).unwrap().destination(),
            Some(SocketAddrV4::new(LOCAL, 8888))
        );

        let reply = build_tcp(SocketAddrV4::new(LOCAL, 8888), client(), TCP_SYN | TCP_ACK, b"");
        assert_eq!(driver.inject(&reply, PacketMeta::outbound()), 1);
        let sent = driver.wait_sent(2, Duration::from_secs(2)).await;
        assert_eq!(inspect(&sent[1].data).unwrap().source(), Some(server()));
        assert!(sent[1].meta.outbound);

        redirector.stop().await;
        assert_eq!(driver.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_port_forward_fallback() {
        let os = os();
        let redirector = Redirector::start(config(), None, os.clone()).await.unwrap();
        assert_eq!(redirector.mode(), RedirectMode::PortForward);
        redirector.stop().await;
        assert_eq!(
            os.calls(),
            vec![
                "add_port_forward 80 8888",
                "add_port_forward 443 8888",
                "remove_port_forward 80 8888",
                "remove_port_forward 443 8888",
            ]
        );
    }

    #[tokio::test]
    async fn test_port_forward_failure_is_an_error() {
        let os = Arc::new(
            RecordingNetwork::new(LOCAL, MacAddr::new(2, 0, 0, 0, 0, 5)).without_port_forward(),
        );
        assert!(Redirector::start(config(), None, os).await.is_err());
    }
}
