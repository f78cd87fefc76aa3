//! # Packet Forge
//!
//! Command line front end for the packet_forge engine.
//!
//! ## Features
//! - Full LAN man-in-the-middle: ARP spoofing, redirection, monitoring and shaping
//! - Standalone intercepting proxy for explicitly configured clients
//! - Local certificate authority management
//! - Rule-driven response rewriting loaded from JSON files
//! - Self-refreshing HTML report of every recorded session

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use packet_forge::certs::{CaOptions, CertificateAuthority};
use packet_forge::controller::{HttpsChoice, MitmController, MitmOptions};
use packet_forge::driver::{CaptureDriver, PcapDriver, PnetLink};
use packet_forge::events::{self, MitmEvent, SessionRecorder};
use packet_forge::network::Host;
use packet_forge::os::{NetworkConfigurator, SystemNetwork};
use packet_forge::proxy::{HttpsMode, ListenMode, ProxyConfig, ProxyServer, ProxyServices, DEFAULT_MAX_BODY_BYTES};
use packet_forge::store::{MemoryStore, DEFAULT_MAX_SESSIONS};
use packet_forge::{report, Error, Result};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "packet_forge")]
#[command(author, version)]
#[command(about = "LAN man-in-the-middle and rewriting proxy")]
#[command(long_about = "Poisons the ARP caches of chosen targets, redirects their web traffic \
    to a local proxy and rewrites responses according to JSON rules. Requires root \
    privileges for everything except the standalone proxy and CA commands.")]
struct Cli {
    /// Directory holding the CA and minted certificates
    #[arg(long, global = true, default_value = ".packet_forge")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Intercept the traffic of LAN targets until Ctrl-C
    Run(RunArgs),
    /// Run only the proxy for explicitly configured clients
    Proxy(ProxyArgs),
    /// Create the certificate authority if needed and print its certificate path
    Ca,
}

#[derive(clap::Args)]
struct StoreArgs {
    /// JSON file with rewrite rules
    #[arg(long)]
    rules: Option<PathBuf>,

    /// JSON file with resources referenced by rules
    #[arg(long)]
    resources: Option<PathBuf>,

    /// Directory to keep report.html in
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Number of recent sessions kept for the report
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON options file; flags given here override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface to operate on
    #[arg(short, long)]
    interface: Option<String>,

    /// Gateway as ip or ip=mac
    #[arg(short, long)]
    gateway: Option<String>,

    /// Target as ip or ip=mac, may be repeated
    #[arg(short, long = "target")]
    targets: Vec<String>,

    /// off, observe, tunnel or mitm
    #[arg(long, value_parser = parse_https)]
    https: Option<HttpsChoice>,

    /// Ports treated as HTTP, e.g. "80,8080" or "*"
    #[arg(long)]
    http_ports: Option<String>,

    /// Ports treated as HTTPS, e.g. "443" or "*"
    #[arg(long)]
    https_ports: Option<String>,

    #[arg(long)]
    proxy_port: Option<u16>,

    /// Per-target upload limit in kbit/s
    #[arg(long)]
    upload_kbps: Option<u64>,

    /// Per-target download limit in kbit/s
    #[arg(long)]
    download_kbps: Option<u64>,

    /// Address of this machine on the interface, when detection picks the wrong one
    #[arg(long)]
    local_ip: Option<Ipv4Addr>,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(clap::Args)]
struct ProxyArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = packet_forge::proxy::DEFAULT_PORT)]
    port: u16,

    /// Decrypt CONNECT tunnels with minted certificates
    #[arg(long)]
    mitm: bool,

    /// Accept redirected connections instead of proxy requests
    #[arg(long)]
    transparent: bool,

    /// Do not verify origin certificates
    #[arg(long)]
    insecure_upstream: bool,

    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    #[command(flatten)]
    store: StoreArgs,
}

fn parse_https(value: &str) -> std::result::Result<HttpsChoice, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("expected off, observe, tunnel or mitm, got {}", value))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let ca = Arc::new(CertificateAuthority::new(CaOptions {
        base_dir: cli.data_dir.clone(),
        ..Default::default()
    }));

    let outcome = match cli.command {
        Command::Ca => print_ca(&ca).await,
        Command::Proxy(args) => run_proxy(args, ca).await,
        Command::Run(args) => run_mitm(args, ca).await,
    };

    if let Err(e) = outcome {
        error!("packet_forge failed: {}", e);
        std::process::exit(1);
    }
}

async fn print_ca(ca: &CertificateAuthority) -> Result<()> {
    ca.ensure_ca().await?;
    let status = ca.status().await;
    debug!("CA status: {:?}", status);
    println!("{}", ca.ca_cert_path().display());
    Ok(())
}

fn load_store(args: &StoreArgs) -> Result<Arc<MemoryStore>> {
    let store = MemoryStore::new().with_session_limit(args.max_sessions);
    if let Some(path) = &args.rules {
        let count = store.load_rules_file(path)?;
        info!("Loaded {} rules from {}", count, path.display());
    }
    if let Some(path) = &args.resources {
        let count = store.load_resources_file(path)?;
        info!("Loaded {} resources from {}", count, path.display());
    }
    Ok(Arc::new(store))
}

/// Logs engine events as they arrive.
fn spawn_event_logger(mut events: UnboundedReceiver<MitmEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MitmEvent::Session(record) => {
                    let entry = &record.entry;
                    let rule = match (&entry.matched_rule_id, entry.applied) {
                        (Some(id), true) => format!(" [rule {}]", id),
                        (Some(id), false) => format!(" [rule {} not applied]", id),
                        (None, _) => String::new(),
                    };
                    info!(
                        "#{} {} {} {} {}{}",
                        record.id,
                        entry.method,
                        entry.url,
                        entry.status,
                        report::format_bytes(entry.size_bytes),
                        rule
                    );
                    if let Some(e) = &entry.error {
                        debug!("#{} error: {}", record.id, e);
                    }
                }
                MitmEvent::Status(status) => debug!("Status: {:?}", status.state),
            }
        }
    })
}

/// Rewrites the report every few seconds until aborted.
fn spawn_report_updater(dir: PathBuf, store: Arc<MemoryStore>) -> JoinHandle<()> {
    let started = Utc::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = report::write_report(&dir, &store.sessions(), started) {
                warn!("Failed to update report: {}", e);
            }
        }
    })
}

fn final_report(dir: Option<&Path>, store: &MemoryStore) {
    if let Some(dir) = dir {
        let started = store
            .sessions()
            .first()
            .map(|s| s.timestamp)
            .unwrap_or_else(Utc::now);
        match report::write_report(dir, &store.sessions(), started) {
            Ok(path) => println!("Report written to {}", path.display()),
            Err(e) => warn!("Failed to write final report: {}", e),
        }
    }
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}

async fn run_proxy(args: ProxyArgs, ca: Arc<CertificateAuthority>) -> Result<()> {
    let store = load_store(&args.store)?;
    let (tx, rx) = events::channel();
    let logger = spawn_event_logger(rx);
    let recorder = SessionRecorder::new(store.clone()).with_events(tx);
    let services = ProxyServices::new(store.clone(), recorder).with_ca(ca.clone());

    let config = ProxyConfig {
        host: args.host,
        port: args.port,
        https_mode: if args.mitm { HttpsMode::Mitm } else { HttpsMode::Tunnel },
        listen_mode: if args.transparent {
            ListenMode::Transparent
        } else {
            ListenMode::Explicit
        },
        max_body_bytes: args.max_body_bytes,
        insecure_upstream: args.insecure_upstream,
        ..Default::default()
    };
    let proxy = ProxyServer::start(config, services).await?;
    println!("Proxy listening on {}", proxy.local_addr());
    if args.mitm {
        println!("Clients must trust {}", ca.ca_cert_path().display());
    }

    let updater = args
        .store
        .report
        .clone()
        .map(|dir| spawn_report_updater(dir, store.clone()));

    let waited = wait_for_ctrl_c().await;
    proxy.stop().await;
    if let Some(updater) = updater {
        updater.abort();
    }
    logger.abort();
    final_report(args.store.report.as_deref(), &store);
    waited
}

/// Accepts "ip=mac" directly and looks bare IPs up in the neighbour table.
async fn resolve_host(os: &dyn NetworkConfigurator, text: &str) -> Result<Host> {
    if text.contains('=') {
        return text.parse::<Host>().map_err(Error::config);
    }
    let ip: Ipv4Addr = text
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid IP address {}: {}", text, e)))?;
    let mac = os.neighbor_mac(ip).await.ok_or_else(|| {
        Error::config(format!(
            "No MAC address known for {}; ping it first or pass ip=mac",
            ip
        ))
    })?;
    Ok(Host::new(ip, mac))
}

async fn build_options(args: &RunArgs, os: &dyn NetworkConfigurator) -> Result<MitmOptions> {
    let mut options = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => MitmOptions::default(),
    };

    if let Some(interface) = &args.interface {
        options.interface = interface.clone();
    }
    if let Some(gateway) = &args.gateway {
        options.gateway = Some(resolve_host(os, gateway).await?);
    }
    if !args.targets.is_empty() {
        let mut targets = Vec::with_capacity(args.targets.len());
        for target in &args.targets {
            targets.push(resolve_host(os, target).await?);
        }
        options.targets = targets;
    }
    if let Some(https) = args.https {
        options.https = https;
    }
    if args.http_ports.is_some() {
        options.http_ports = args.http_ports.clone();
    }
    if args.https_ports.is_some() {
        options.https_ports = args.https_ports.clone();
    }
    if let Some(port) = args.proxy_port {
        options.proxy_port = port;
    }
    if let Some(kbps) = args.upload_kbps {
        options.throttle.upload_kbps = kbps;
    }
    if let Some(kbps) = args.download_kbps {
        options.throttle.download_kbps = kbps;
    }
    if args.local_ip.is_some() {
        options.local_ip = args.local_ip;
    }

    if options.interface.is_empty() {
        return Err(Error::config("No interface given"));
    }
    Ok(options)
}

async fn run_mitm(args: RunArgs, ca: Arc<CertificateAuthority>) -> Result<()> {
    let os = Arc::new(SystemNetwork::new());
    let options = build_options(&args, os.as_ref()).await?;
    let store = load_store(&args.store)?;

    let (tx, rx) = events::channel();
    let logger = spawn_event_logger(rx);
    let recorder = SessionRecorder::new(store.clone()).with_events(tx);
    let services = ProxyServices::new(store.clone(), recorder).with_ca(ca.clone());

    let driver: Option<Arc<dyn CaptureDriver>> = match PcapDriver::new(&options.interface) {
        Ok(driver) => Some(Arc::new(driver)),
        Err(e) => {
            warn!("Packet capture unavailable, falling back to OS forwarding: {}", e);
            None
        }
    };

    let intercepts_https = options.https == HttpsChoice::Mitm;
    let interface = options.interface.clone();
    let mut controller = MitmController::new(os, Arc::new(PnetLink::new()), driver, services);
    let status = controller.start(options).await?;
    info!("Intercepting {} targets on {}", status.targets.len(), interface);
    if let Some(addr) = status.proxy_addr {
        info!("Proxy at {}", addr);
    }
    if intercepts_https {
        println!("Targets must trust {}", ca.ca_cert_path().display());
    }

    let updater = args
        .store
        .report
        .clone()
        .map(|dir| spawn_report_updater(dir, store.clone()));

    let waited = wait_for_ctrl_c().await;
    let status = controller.stop().await;
    debug!("Final resource states: {:?}", status.resources);
    if let Some(updater) = updater {
        updater.abort();
    }
    logger.abort();
    final_report(args.store.report.as_deref(), &store);
    waited
}
