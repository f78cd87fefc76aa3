// src/os.rs

//! Operating-system network configuration.
//!
//! Everything here shells out to the platform tools. Command output is only
//! searched for the bits we need (a MAC address, a uid), never parsed in full.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info, warn};
use pnet::util::MacAddr;
use tokio::process::Command;

use crate::driver::datalink::find_interface;
use crate::error::{Error, Result};
use crate::network::parse_mac;

#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Fails with [`Error::Privilege`] unless the process may capture and inject.
    async fn check_privileges(&self) -> Result<()>;

    async fn enable_ip_forwarding(&self, interface: &str) -> Result<()>;

    async fn disable_ip_forwarding(&self, interface: &str) -> Result<()>;

    async fn add_static_arp(&self, interface: &str, ip: Ipv4Addr, mac: MacAddr) -> Result<()>;

    async fn remove_static_arp(&self, interface: &str, ip: Ipv4Addr) -> Result<()>;

    /// Redirects local TCP `port` to `proxy_port` without a capture driver.
    async fn add_port_forward(&self, port: u16, proxy_port: u16) -> Result<()>;

    async fn remove_port_forward(&self, port: u16, proxy_port: u16) -> Result<()>;

    fn local_ipv4(&self, interface: &str) -> Option<Ipv4Addr>;

    fn local_mac(&self, interface: &str) -> Option<MacAddr>;

    /// MAC of `ip` from the neighbour table.
    async fn neighbor_mac(&self, ip: Ipv4Addr) -> Option<MacAddr>;
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Command(format!("{}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(Error::Command(format!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// First token of `text` that reads as a usable MAC address.
pub fn find_mac(text: &str) -> Option<MacAddr> {
    text.split_whitespace()
        .filter_map(|token| parse_mac(token).ok())
        .find(|mac| *mac != MacAddr::zero() && *mac != MacAddr::broadcast())
}

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Configuration through the host's own tools.
#[derive(Default)]
pub struct SystemNetwork {
    /// Forwarding state found before we enabled it
    forwarding_before: Mutex<Option<bool>>,
}

impl SystemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    async fn forwarding_enabled(&self) -> Option<bool> {
        let value = if cfg!(target_os = "linux") {
            tokio::fs::read_to_string(IP_FORWARD_PATH).await.ok()?
        } else if cfg!(target_os = "macos") {
            run("sysctl", &["-n", "net.inet.ip.forwarding"]).await.ok()?
        } else {
            return None;
        };
        Some(value.trim() == "1")
    }

    async fn set_forwarding(&self, interface: &str, enabled: bool) -> Result<()> {
        if cfg!(target_os = "linux") {
            tokio::fs::write(IP_FORWARD_PATH, if enabled { "1\n" } else { "0\n" }).await?;
            Ok(())
        } else if cfg!(target_os = "macos") {
            let value = format!("net.inet.ip.forwarding={}", u8::from(enabled));
            run("sysctl", &["-w", &value]).await.map(|_| ())
        } else if cfg!(windows) {
            let state = if enabled {
                "forwarding=enabled"
            } else {
                "forwarding=disabled"
            };
            run(
                "netsh",
                &["interface", "ipv4", "set", "interface", interface, state],
            )
            .await
            .map(|_| ())
        } else {
            Err(Error::DriverUnavailable(
                "IP forwarding is not supported on this platform".into(),
            ))
        }
    }
}

#[async_trait]
impl NetworkConfigurator for SystemNetwork {
    async fn check_privileges(&self) -> Result<()> {
        let elevated = if cfg!(windows) {
            run("net", &["session"]).await.is_ok()
        } else {
            run("id", &["-u"])
                .await
                .map(|uid| uid.trim() == "0")
                .unwrap_or(false)
        };

        if elevated {
            Ok(())
        } else if cfg!(windows) {
            Err(Error::Privilege(
                "Run as Administrator to spoof ARP and redirect traffic".into(),
            ))
        } else {
            Err(Error::Privilege(
                "root privileges are required for packet capture and injection".into(),
            ))
        }
    }

    async fn enable_ip_forwarding(&self, interface: &str) -> Result<()> {
        let before = self.forwarding_enabled().await;
        if let Ok(mut slot) = self.forwarding_before.lock() {
            if slot.is_none() {
                *slot = before;
            }
        }
        if before == Some(true) {
            debug!("IP forwarding already enabled");
            return Ok(());
        }
        self.set_forwarding(interface, true).await?;
        info!("IP forwarding enabled");
        Ok(())
    }

    async fn disable_ip_forwarding(&self, interface: &str) -> Result<()> {
        let before = self
            .forwarding_before
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if before == Some(true) {
            debug!("IP forwarding was on before start, leaving it on");
            return Ok(());
        }
        self.set_forwarding(interface, false).await?;
        info!("IP forwarding disabled");
        Ok(())
    }

    async fn add_static_arp(&self, interface: &str, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        let ip = ip.to_string();
        if cfg!(windows) {
            let mac = mac.to_string().replace(':', "-");
            run("arp", &["-s", &ip, &mac]).await.map(|_| ())
        } else {
            let mac = mac.to_string();
            run("arp", &["-i", interface, "-s", &ip, &mac]).await.map(|_| ())
        }
    }

    async fn remove_static_arp(&self, interface: &str, ip: Ipv4Addr) -> Result<()> {
        let ip = ip.to_string();
        if cfg!(windows) {
            run("arp", &["-d", &ip]).await.map(|_| ())
        } else {
            run("arp", &["-i", interface, "-d", &ip]).await.map(|_| ())
        }
    }

    async fn add_port_forward(&self, port: u16, proxy_port: u16) -> Result<()> {
        let (port, proxy_port) = (port.to_string(), proxy_port.to_string());
        if cfg!(target_os = "linux") {
            run(
                "iptables",
                &[
                    "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", &port, "-j",
                    "REDIRECT", "--to-ports", &proxy_port,
                ],
            )
            .await
            .map(|_| ())
        } else if cfg!(windows) {
            let listen = format!("listenport={}", port);
            let connect = format!("connectport={}", proxy_port);
            run(
                "netsh",
                &[
                    "interface", "portproxy", "add", "v4tov4", &listen,
                    "listenaddress=0.0.0.0", &connect, "connectaddress=127.0.0.1",
                ],
            )
            .await
            .map(|_| ())
        } else {
            Err(Error::DriverUnavailable(
                "no port-forward fallback on this platform".into(),
            ))
        }
    }

    async fn remove_port_forward(&self, port: u16, proxy_port: u16) -> Result<()> {
        let (port, proxy_port) = (port.to_string(), proxy_port.to_string());
        if cfg!(target_os = "linux") {
            run(
                "iptables",
                &[
                    "-t", "nat", "-D", "PREROUTING", "-p", "tcp", "--dport", &port, "-j",
                    "REDIRECT", "--to-ports", &proxy_port,
                ],
            )
            .await
            .map(|_| ())
        } else if cfg!(windows) {
            let listen = format!("listenport={}", port);
            run(
                "netsh",
                &[
                    "interface", "portproxy", "delete", "v4tov4", &listen,
                    "listenaddress=0.0.0.0",
                ],
            )
            .await
            .map(|_| ())
        } else {
            Err(Error::DriverUnavailable(
                "no port-forward fallback on this platform".into(),
            ))
        }
    }

    fn local_ipv4(&self, interface: &str) -> Option<Ipv4Addr> {
        find_interface(interface)?
            .ips
            .iter()
            .find_map(|net| match net.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
    }

    fn local_mac(&self, interface: &str) -> Option<MacAddr> {
        find_interface(interface)?.mac
    }

    async fn neighbor_mac(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let ip_text = ip.to_string();
        let output = if cfg!(target_os = "linux") {
            run("ip", &["neigh", "show", &ip_text]).await
        } else if cfg!(windows) {
            run("arp", &["-a", &ip_text]).await
        } else {
            run("arp", &["-n", &ip_text]).await
        };
        match output {
            Ok(text) => find_mac(&text),
            Err(e) => {
                warn!("Neighbour lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

/// Configurator that records what it was asked to do, for tests and dry runs.
pub struct RecordingNetwork {
    privileged: bool,
    port_forward: bool,
    local_ip: Ipv4Addr,
    local_mac: MacAddr,
    calls: Mutex<Vec<String>>,
}

impl RecordingNetwork {
    pub fn new(local_ip: Ipv4Addr, local_mac: MacAddr) -> Self {
        RecordingNetwork {
            privileged: true,
            port_forward: true,
            local_ip,
            local_mac,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    pub fn without_port_forward(mut self) -> Self {
        self.port_forward = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl NetworkConfigurator for RecordingNetwork {
    async fn check_privileges(&self) -> Result<()> {
        self.push("check_privileges".into());
        if self.privileged {
            Ok(())
        } else {
            Err(Error::Privilege("not elevated".into()))
        }
    }

    async fn enable_ip_forwarding(&self, interface: &str) -> Result<()> {
        self.push(format!("enable_ip_forwarding {}", interface));
        Ok(())
    }

    async fn disable_ip_forwarding(&self, interface: &str) -> Result<()> {
        self.push(format!("disable_ip_forwarding {}", interface));
        Ok(())
    }

    async fn add_static_arp(&self, interface: &str, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        self.push(format!("add_static_arp {} {} {}", interface, ip, mac));
        Ok(())
    }

    async fn remove_static_arp(&self, interface: &str, ip: Ipv4Addr) -> Result<()> {
        self.push(format!("remove_static_arp {} {}", interface, ip));
        Ok(())
    }

    async fn add_port_forward(&self, port: u16, proxy_port: u16) -> Result<()> {
        self.push(format!("add_port_forward {} {}", port, proxy_port));
        if self.port_forward {
            Ok(())
        } else {
            Err(Error::DriverUnavailable("no port forwarding".into()))
        }
    }

    async fn remove_port_forward(&self, port: u16, proxy_port: u16) -> Result<()> {
        self.push(format!("remove_port_forward {} {}", port, proxy_port));
        Ok(())
    }

    fn local_ipv4(&self, _interface: &str) -> Option<Ipv4Addr> {
        Some(self.local_ip)
    }

    fn local_mac(&self, _interface: &str) -> Option<MacAddr> {
        Some(self.local_mac)
    }

    async fn neighbor_mac(&self, _ip: Ipv4Addr) -> Option<MacAddr> {
        None
    }
}
