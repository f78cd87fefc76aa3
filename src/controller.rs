// src/controller.rs

//! Orchestration of the packet plane and the proxy.
//!
//! Components come up in the order traffic needs them: the proxy first, so
//! redirected connections have somewhere to land, ARP spoofing last, so no
//! victim is lured in before the path is ready. Teardown runs in reverse.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::arp::{ArpBackend, ArpConfig, ArpSpoofer};
use crate::driver::{CaptureDriver, LinkLayer};
use crate::error::{Error, Result};
use crate::events::MitmEvent;
use crate::monitor::{FlowMonitor, MonitorConfig};
use crate::network::Host;
use crate::os::NetworkConfigurator;
use crate::ports::PortSpec;
use crate::proxy::{HttpsMode, ListenMode, ProxyConfig, ProxyServer, ProxyServices, DEFAULT_MAX_BODY_BYTES};
use crate::redirect::{RedirectConfig, RedirectMode, Redirector};
use crate::shaper::{ShaperConfig, TrafficShaper};

/// Upper bound on each teardown step.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How HTTPS traffic of the targets is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpsChoice {
    /// Left alone
    #[default]
    Off,
    /// Flow monitoring only, labelled by SNI
    Observe,
    /// Redirected and spliced through the proxy
    Tunnel,
    /// Redirected and decrypted with minted certificates
    Mitm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleOptions {
    pub upload_kbps: u64,
    pub download_kbps: u64,
}

impl ThrottleOptions {
    pub fn is_enabled(&self) -> bool {
        self.upload_kbps > 0 || self.download_kbps > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MitmOptions {
    pub interface: String,
    pub gateway: Option<Host>,
    pub targets: Vec<Host>,
    pub proxy_host: IpAddr,
    pub proxy_port: u16,
    pub https: HttpsChoice,
    /// Port spec such as "80,8080"; "*" observes every port without redirecting
    pub http_ports: Option<String>,
    pub https_ports: Option<String>,
    pub throttle: ThrottleOptions,
    /// Overrides the interface address given to the redirector and monitor
    pub local_ip: Option<Ipv4Addr>,
    pub max_body_bytes: usize,
}

impl Default for MitmOptions {
    fn default() -> Self {
        MitmOptions {
            interface: String::new(),
            gateway: None,
            targets: Vec::new(),
            proxy_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proxy_port: crate::proxy::DEFAULT_PORT,
            https: HttpsChoice::Off,
            http_ports: None,
            https_ports: None,
            throttle: ThrottleOptions::default(),
            local_ip: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Which ports get redirected and how the monitor complements them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MitmPlan {
    pub http_ports: PortSpec,
    pub https_ports: PortSpec,
    pub redirect_http: PortSpec,
    pub redirect_https: PortSpec,
    pub https_mode: HttpsMode,
    pub observe_https: bool,
    pub http_listen_only: bool,
    pub https_listen_only: bool,
}

impl MitmPlan {
    /// Derives the plan from user options.
    ///
    /// A spec covering every port cannot be redirected without swallowing
    /// the host's own traffic, so it turns into listen-only monitoring.
    ///
    /// # Examples
    ///
    /// ```
    /// use packet_forge::controller::{HttpsChoice, MitmOptions, MitmPlan};
    ///
    /// let plan = MitmPlan::from_options(&MitmOptions {
    ///     https: HttpsChoice::Mitm,
    ///     ..Default::default()
    /// });
    /// assert_eq!(plan.redirect_ports().to_string(), "80,443");
    /// assert!(!plan.monitor_tcp());
    /// ```
    pub fn from_options(options: &MitmOptions) -> Self {
        let observe_https = options.https == HttpsChoice::Observe;
        let https_redirected = matches!(options.https, HttpsChoice::Tunnel | HttpsChoice::Mitm);

        let http_ports = PortSpec::parse_or(options.http_ports.as_deref(), "80");
        let https_ports = if https_redirected || observe_https {
            PortSpec::parse_or(options.https_ports.as_deref(), "443")
        } else {
            PortSpec::empty()
        };

        let http_listen_only = http_ports.is_all();
        let https_listen_only = (https_redirected || observe_https) && https_ports.is_all();
        let redirect_http = if http_listen_only {
            PortSpec::empty()
        } else {
            http_ports.clone()
        };
        let redirect_https = if https_redirected && !https_listen_only {
            https_ports.clone()
        } else {
            PortSpec::empty()
        };
        let https_mode = if options.https == HttpsChoice::Mitm && !redirect_https.is_empty() {
            HttpsMode::Mitm
        } else {
            HttpsMode::Tunnel
        };

        MitmPlan {
            http_ports,
            https_ports,
            redirect_http,
            redirect_https,
            https_mode,
            observe_https,
            http_listen_only,
            https_listen_only,
        }
    }

    pub fn has_redirect(&self) -> bool {
        !self.redirect_http.is_empty() || !self.redirect_https.is_empty()
    }

    pub fn redirect_ports(&self) -> PortSpec {
        PortSpec::merge(&[&self.redirect_http, &self.redirect_https])
    }

    /// TCP flows are monitored unless both protocols are already redirected.
    pub fn monitor_tcp(&self) -> bool {
        self.observe_https || self.redirect_http.is_empty() || self.redirect_https.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ResourceState {
    #[default]
    Stopped,
    Running,
    /// Up, but with a weaker backend than requested
    Degraded(String),
    Failed(String),
}

impl ResourceState {
    pub fn is_active(&self) -> bool {
        matches!(self, ResourceState::Running | ResourceState::Degraded(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ControllerState {
    #[default]
    Stopped,
    Running,
    /// Shaper stopped and recording silenced
    Paused,
    /// Packet path fully vacated
    PausedHard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStates {
    pub proxy: ResourceState,
    pub forwarding: ResourceState,
    pub redirector: ResourceState,
    pub shaper: ResourceState,
    pub monitor: ResourceState,
    pub spoofer: ResourceState,
}

/// Snapshot of the controller, also published as [`MitmEvent::Status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MitmStatus {
    pub state: ControllerState,
    pub interface: Option<String>,
    pub gateway: Option<Host>,
    pub targets: Vec<Host>,
    pub plan: Option<MitmPlan>,
    pub throttle: ThrottleOptions,
    pub resources: ResourceStates,
    pub proxy_addr: Option<SocketAddr>,
    pub redirect_mode: Option<RedirectMode>,
    pub arp_backend: Option<ArpBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Soft,
    Hard,
}

/// Everything a running session owns.
struct Session {
    options: MitmOptions,
    gateway: Host,
    plan: MitmPlan,
    local_ip: Option<Ipv4Addr>,
    paused: Option<Pause>,
    states: ResourceStates,
    proxy: Option<ProxyServer>,
    redirector: Option<Redirector>,
    shaper: Option<TrafficShaper>,
    monitor: Option<FlowMonitor>,
    spoofer: Option<ArpSpoofer>,
}

impl Session {
    fn target_ips(&self) -> Vec<Ipv4Addr> {
        self.options.targets.iter().map(|t| t.ip).collect()
    }

    fn proxy_port(&self) -> u16 {
        self.proxy
            .as_ref()
            .map(|p| p.local_addr().port())
            .unwrap_or(self.options.proxy_port)
    }
}

/// Bounds a teardown step to [`STOP_TIMEOUT`].
async fn bounded<F>(label: &str, step: F, task: Option<AbortHandle>)
where
    F: Future<Output = ()>,
{
    bounded_within(label, STOP_TIMEOUT, step, task).await
}

/// Runs `step` for at most `limit`. On expiry the component's task is
/// aborted, dropping whatever capture handles and sockets it still owns.
async fn bounded_within<F>(label: &str, limit: Duration, step: F, task: Option<AbortHandle>)
where
    F: Future<Output = ()>,
{
    if tokio::time::timeout(limit, step).await.is_err() {
        warn!("{} did not finish within {:?}, forcing it closed", label, limit);
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Shared collaborators, kept apart from the session so both can be
/// borrowed at once.
struct Deps {
    os: Arc<dyn NetworkConfigurator>,
    link: Arc<dyn LinkLayer>,
    driver: Option<Arc<dyn CaptureDriver>>,
    services: ProxyServices,
}

impl Deps {
    async fn start_proxy(&self, session: &mut Session) -> Result<()> {
        if session.proxy.is_some() || !session.plan.has_redirect() {
            return Ok(());
        }
        let config = ProxyConfig {
            host: session.options.proxy_host,
            port: session.options.proxy_port,
            https_mode: session.plan.https_mode,
            listen_mode: ListenMode::Transparent,
            max_body_bytes: session.options.max_body_bytes,
            ..Default::default()
        };
        match ProxyServer::start(config, self.services.clone()).await {
            Ok(proxy) => {
                session.proxy = Some(proxy);
                session.states.proxy = ResourceState::Running;
                Ok(())
            }
            Err(e) => {
                session.states.proxy = ResourceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_redirector(&self, session: &mut Session) -> Result<()> {
        if session.redirector.is_some() || !session.plan.has_redirect() || session.options.targets.is_empty() {
            return Ok(());
        }
        let config = RedirectConfig {
            ports: session.plan.redirect_ports(),
            proxy_port: session.proxy_port(),
            targets: session.target_ips(),
            local_ip: session.local_ip,
            ..Default::default()
        };
        match Redirector::start(config, self.driver.clone(), Arc::clone(&self.os)).await {
            Ok(redirector) => {
                session.states.redirector = match redirector.mode() {
                    RedirectMode::Driver => ResourceState::Running,
                    RedirectMode::PortForward => {
                        ResourceState::Degraded("OS port forwarding".to_string())
                    }
                };
                session.redirector = Some(redirector);
                Ok(())
            }
            Err(e) => {
                session.states.redirector = ResourceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Shaping is optional: failures are logged, never fatal.
    fn start_shaper(&self, session: &mut Session) {
        let throttle = session.options.throttle;
        if session.shaper.is_some() || !throttle.is_enabled() || session.options.targets.is_empty() {
            return;
        }
        let Some(driver) = self.driver.clone() else {
            warn!("Traffic shaping needs a capture driver, skipping");
            session.states.shaper = ResourceState::Failed("no capture driver".to_string());
            return;
        };
        let config = ShaperConfig {
            targets: session.target_ips(),
            upload_kbps: throttle.upload_kbps,
            download_kbps: throttle.download_kbps,
        };
        match TrafficShaper::start(config, driver) {
            Ok(shaper) => {
                session.shaper = Some(shaper);
                session.states.shaper = ResourceState::Running;
            }
            Err(e) => {
                warn!("Traffic shaper failed to start: {}", e);
                session.states.shaper = ResourceState::Failed(e.to_string());
            }
        }
    }

    /// Monitoring is optional: failures are logged, never fatal.
    fn start_monitor(&self, session: &mut Session) {
        if session.monitor.is_some() || session.options.targets.is_empty() {
            return;
        }
        let Some(driver) = self.driver.clone() else {
            warn!("Flow monitoring needs a capture driver, skipping");
            session.states.monitor = ResourceState::Failed("no capture driver".to_string());
            return;
        };

        let redirecting = session.plan.has_redirect();
        let mut config = MonitorConfig {
            targets: session.target_ips(),
            udp: true,
            tcp: session.plan.monitor_tcp(),
            ignore_ports: session.plan.redirect_ports(),
            local_ip: redirecting.then(|| session.local_ip.unwrap_or(Ipv4Addr::LOCALHOST)),
            proxy_port: redirecting.then(|| session.proxy_port()),
            ..Default::default()
        };
        if session.plan.observe_https {
            config = config.observe_https();
        }

        match FlowMonitor::start(config, driver, self.services.recorder.clone()) {
            Ok(monitor) => {
                session.monitor = Some(monitor);
                session.states.monitor = ResourceState::Running;
            }
            Err(e) => {
                warn!("Flow monitor disabled: {}", e);
                session.states.monitor = ResourceState::Failed(e.to_string());
            }
        }
    }

    async fn start_spoofer(&self, session: &mut Session) -> Result<()> {
        if session.spoofer.is_some() {
            return Ok(());
        }
        let config = ArpConfig::new(
            &session.options.interface,
            session.gateway,
            session.options.targets.clone(),
        );
        match ArpSpoofer::start(config, self.link.as_ref(), Arc::clone(&self.os)).await {
            Ok(spoofer) => {
                session.states.spoofer = match spoofer.backend() {
                    ArpBackend::Link => ResourceState::Running,
                    ArpBackend::StaticArp => ResourceState::Degraded("static ARP entries".to_string()),
                };
                session.spoofer = Some(spoofer);
                Ok(())
            }
            Err(e) => {
                session.states.spoofer = ResourceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Proxy, forwarding, redirector, shaper, monitor, spoofer.
    async fn bring_up(&self, session: &mut Session) -> Result<()> {
        if session.plan.has_redirect() {
            self.start_proxy(session).await?;
        } else {
            warn!("No ports to redirect, running in listen-only mode");
        }

        self.os.enable_ip_forwarding(&session.options.interface).await?;
        session.states.forwarding = ResourceState::Running;

        self.start_redirector(session).await?;
        self.start_shaper(session);
        self.start_monitor(session);
        self.start_spoofer(session).await
    }

    /// Restores what a hard pause took down.
    async fn bring_back(&self, session: &mut Session) -> Result<()> {
        self.start_proxy(session).await?;
        self.start_redirector(session).await?;
        self.start_shaper(session);
        self.start_monitor(session);
        self.start_spoofer(session).await
    }

    async fn stop_shaper(&self, session: &mut Session) {
        if let Some(shaper) = session.shaper.take() {
            let task = Some(shaper.abort_handle());
            bounded("Traffic shaper stop", shaper.stop(), task).await;
        }
        session.states.shaper = ResourceState::Stopped;
    }

    async fn stop_monitor(&self, session: &mut Session, flush: bool) {
        if let Some(monitor) = session.monitor.take() {
            let task = Some(monitor.abort_handle());
            bounded("Flow monitor stop", monitor.stop(flush), task).await;
        }
        session.states.monitor = ResourceState::Stopped;
    }

    async fn stop_redirector(&self, session: &mut Session) {
        if let Some(redirector) = session.redirector.take() {
            let task = redirector.abort_handle();
            bounded("Redirector stop", redirector.stop(), task).await;
        }
        session.states.redirector = ResourceState::Stopped;
    }

    async fn stop_spoofer(&self, session: &mut Session) {
        if let Some(spoofer) = session.spoofer.take() {
            let task = Some(spoofer.abort_handle());
            bounded("ARP spoofer stop", spoofer.stop(), task).await;
        }
        session.states.spoofer = ResourceState::Stopped;
    }

    async fn stop_proxy(&self, session: &mut Session) {
        if let Some(proxy) = session.proxy.take() {
            let task = Some(proxy.abort_handle());
            bounded("Proxy stop", proxy.stop(), task).await;
        }
        session.states.proxy = ResourceState::Stopped;
    }

    /// Everything but IP forwarding, for a hard pause.
    async fn vacate(&self, session: &mut Session) {
        self.stop_spoofer(session).await;
        self.stop_monitor(session, false).await;
        self.stop_shaper(session).await;
        self.stop_redirector(session).await;
        self.stop_proxy(session).await;
    }

    /// Full teardown in reverse start order.
    async fn tear_down(&self, session: &mut Session) {
        self.stop_spoofer(session).await;
        let flush = session.paused.is_none();
        self.stop_monitor(session, flush).await;
        self.stop_shaper(session).await;
        self.stop_redirector(session).await;
        if session.states.forwarding != ResourceState::Stopped {
            let interface = session.options.interface.clone();
            let disable = async {
                if let Err(e) = self.os.disable_ip_forwarding(&interface).await {
                    warn!("Failed to disable IP forwarding: {}", e);
                }
            };
            bounded("IP forwarding disable", disable, None).await;
            session.states.forwarding = ResourceState::Stopped;
        }
        self.stop_proxy(session).await;
    }

    /// Pushes the session's target set down to the running components.
    async fn retarget(&self, session: &mut Session) {
        let hard_paused = session.paused == Some(Pause::Hard);
        self.stop_redirector(session).await;
        if !hard_paused {
            if let Err(e) = self.start_redirector(session).await {
                error!("Redirector failed to restart with the new targets: {}", e);
            }
        }

        self.stop_shaper(session).await;
        if session.paused.is_none() {
            self.start_shaper(session);
        }

        let targets = session.target_ips();
        if session.monitor.is_some() {
            if targets.is_empty() {
                self.stop_monitor(session, true).await;
            } else if let Some(monitor) = &session.monitor {
                if let Err(e) = monitor.set_targets(targets) {
                    warn!("Flow monitor did not take the new targets: {}", e);
                }
            }
        } else if !hard_paused {
            self.start_monitor(session);
        }
    }
}

/// Drives a whole interception session.
///
/// ```no_run
/// use std::sync::Arc;
/// use packet_forge::controller::{MitmController, MitmOptions};
/// use packet_forge::driver::datalink::PnetLink;
/// use packet_forge::events::SessionRecorder;
/// use packet_forge::os::SystemNetwork;
/// use packet_forge::proxy::ProxyServices;
/// use packet_forge::store::MemoryStore;
///
/// # async fn run(options: MitmOptions) -> packet_forge::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let services = ProxyServices::new(store.clone(), SessionRecorder::new(store));
/// let mut controller = MitmController::new(
///     Arc::new(SystemNetwork::new()),
///     Arc::new(PnetLink::new()),
///     None,
///     services,
/// );
/// controller.start(options).await?;
/// controller.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct MitmController {
    deps: Deps,
    session: Option<Session>,
}

impl MitmController {
    pub fn new(
        os: Arc<dyn NetworkConfigurator>,
        link: Arc<dyn LinkLayer>,
        driver: Option<Arc<dyn CaptureDriver>>,
        services: ProxyServices,
    ) -> Self {
        MitmController {
            deps: Deps {
                os,
                link,
                driver,
                services,
            },
            session: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> MitmStatus {
        let Some(session) = &self.session else {
            return MitmStatus::default();
        };
        MitmStatus {
            state: match session.paused {
                None => ControllerState::Running,
                Some(Pause::Soft) => ControllerState::Paused,
                Some(Pause::Hard) => ControllerState::PausedHard,
            },
            interface: Some(session.options.interface.clone()),
            gateway: Some(session.gateway),
            targets: session.options.targets.clone(),
            plan: Some(session.plan.clone()),
            throttle: session.options.throttle,
            resources: session.states.clone(),
            proxy_addr: session.proxy.as_ref().map(ProxyServer::local_addr),
            redirect_mode: session.redirector.as_ref().map(Redirector::mode),
            arp_backend: session.spoofer.as_ref().map(ArpSpoofer::backend),
        }
    }

    fn publish(&self) -> MitmStatus {
        let status = self.status();
        self.deps
            .services
            .recorder
            .emit(MitmEvent::Status(status.clone()));
        status
    }

    /// Starts every component in order. On failure whatever came up is torn
    /// down again before the error is returned.
    pub async fn start(&mut self, options: MitmOptions) -> Result<MitmStatus> {
        if self.session.is_some() {
            return Err(Error::state("MITM already running"));
        }
        let gateway = options
            .gateway
            .ok_or_else(|| Error::config("No gateway configured"))?;
        if options.targets.is_empty() {
            return Err(Error::config("No targets configured"));
        }
        self.deps.os.check_privileges().await?;

        let plan = MitmPlan::from_options(&options);
        if plan.http_listen_only {
            warn!("HTTP ports set to all, HTTP is observed without redirection");
        }
        if plan.https_listen_only {
            warn!("HTTPS ports set to all, HTTPS is observed without redirection");
        }
        let local_ip = options
            .local_ip
            .or_else(|| self.deps.os.local_ipv4(&options.interface));
        if local_ip.is_none() {
            warn!("Unable to resolve the local IP of {}", options.interface);
        }
        info!(
            "Starting MITM on {} for {} targets (HTTPS {:?})",
            options.interface,
            options.targets.len(),
            options.https
        );

        let mut session = Session {
            options,
            gateway,
            plan,
            local_ip,
            paused: None,
            states: ResourceStates::default(),
            proxy: None,
            redirector: None,
            shaper: None,
            monitor: None,
            spoofer: None,
        };
        self.deps.services.recorder.set_paused(false);

        if let Err(e) = self.deps.bring_up(&mut session).await {
            error!("MITM start failed: {}", e);
            self.deps.tear_down(&mut session).await;
            return Err(e);
        }

        self.session = Some(session);
        info!("MITM running");
        Ok(self.publish())
    }

    /// Tears everything down. Idempotent.
    pub async fn stop(&mut self) -> MitmStatus {
        if let Some(mut session) = self.session.take() {
            info!("Stopping MITM");
            self.deps.tear_down(&mut session).await;
            self.deps.services.recorder.set_paused(false);
            info!("MITM stopped");
        }
        self.publish()
    }

    /// Soft pause stops shaping and silences recording. Hard pause also
    /// vacates the packet path and the proxy.
    pub async fn pause(&mut self, hard: bool) -> Result<MitmStatus> {
        let deps = &self.deps;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::state("MITM not running"))?;
        if session.paused.is_some() {
            return Ok(self.status());
        }

        session.paused = Some(if hard { Pause::Hard } else { Pause::Soft });
        deps.services.recorder.set_paused(true);
        deps.stop_shaper(session).await;
        if hard {
            deps.vacate(session).await;
        }
        info!("MITM paused ({})", if hard { "hard" } else { "soft" });
        Ok(self.publish())
    }

    /// Reverses whichever pause is in effect.
    ///
    /// If the packet path cannot be restored after a hard pause, the partial
    /// restore is undone and the session stays paused.
    pub async fn resume(&mut self) -> Result<MitmStatus> {
        let deps = &self.deps;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::state("MITM not running"))?;
        let Some(pause) = session.paused else {
            return Ok(self.status());
        };

        if pause == Pause::Hard {
            if let Err(e) = deps.bring_back(session).await {
                error!("Resume failed: {}", e);
                deps.vacate(session).await;
                return Err(e);
            }
        } else {
            deps.start_shaper(session);
        }
        session.paused = None;
        deps.services.recorder.set_paused(false);
        info!("MITM resumed");
        Ok(self.publish())
    }

    /// Adds a target to every component. Only valid while running.
    pub async fn add_target(&mut self, target: Host) -> Result<MitmStatus> {
        let deps = &self.deps;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::state("MITM not running"))?;
        if session.options.targets.iter().any(|t| t.ip == target.ip) {
            return Ok(self.status());
        }

        if let Some(spoofer) = &session.spoofer {
            spoofer.add_target(target)?;
            session.options.targets.push(target);
        } else {
            session.options.targets.push(target);
            if session.paused != Some(Pause::Hard) {
                if let Err(e) = deps.start_spoofer(session).await {
                    session.options.targets.pop();
                    return Err(e);
                }
            }
        }
        deps.retarget(session).await;
        info!("Added target {}", target);
        Ok(self.publish())
    }

    /// Removes a target, restoring its ARP caches first.
    pub async fn remove_target(&mut self, ip: Ipv4Addr) -> Result<MitmStatus> {
        let deps = &self.deps;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::state("MITM not running"))?;
        let Some(index) = session.options.targets.iter().position(|t| t.ip == ip) else {
            return Ok(self.status());
        };

        session.options.targets.remove(index);
        if let Some(spoofer) = &session.spoofer {
            spoofer.remove_target(ip).await?;
        }
        deps.retarget(session).await;
        info!("Removed target {}", ip);
        Ok(self.publish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(https: HttpsChoice, http_ports: Option<&str>, https_ports: Option<&str>) -> MitmPlan {
        MitmPlan::from_options(&MitmOptions {
            https,
            http_ports: http_ports.map(str::to_string),
            https_ports: https_ports.map(str::to_string),
            ..Default::default()
        })
    }

    #[test]
    fn test_plan_http_only() {
        let plan = plan(HttpsChoice::Off, None, Some("8443"));
        assert_eq!(plan.redirect_http.to_string(), "80");
        assert!(plan.redirect_https.is_empty());
        assert!(plan.https_ports.is_empty());
        assert_eq!(plan.https_mode, HttpsMode::Tunnel);
        assert!(plan.monitor_tcp());
    }

    #[test]
    fn test_plan_mitm() {
        let plan = plan(HttpsChoice::Mitm, Some("80,8080"), None);
        assert_eq!(plan.redirect_ports().to_string(), "80,443,8080");
        assert_eq!(plan.https_mode, HttpsMode::Mitm);
        assert!(!plan.monitor_tcp());
    }

    #[test]
    fn test_plan_tunnel() {
        let plan = plan(HttpsChoice::Tunnel, None, None);
        assert_eq!(plan.redirect_https.to_string(), "443");
        assert_eq!(plan.https_mode, HttpsMode::Tunnel);
    }

    #[test]
    fn test_plan_observe() {
        let plan = plan(HttpsChoice::Observe, None, None);
        assert!(plan.observe_https);
        assert_eq!(plan.https_ports.to_string(), "443");
        assert!(plan.redirect_https.is_empty());
        assert!(plan.monitor_tcp());
    }

    #[test]
    fn test_plan_all_ports_listen_only() {
        let plan = plan(HttpsChoice::Mitm, Some("*"), Some("*"));
        assert!(plan.http_listen_only);
        assert!(plan.https_listen_only);
        assert!(!plan.has_redirect());
        assert_eq!(plan.https_mode, HttpsMode::Tunnel);
        assert!(plan.monitor_tcp());
    }

    #[test]
    fn test_options_from_json() {
        let options: MitmOptions = serde_json::from_str(
            r#"{
                "interface": "eth0",
                "gateway": {"ip": "192.168.1.1", "mac": "aa:aa:aa:aa:aa:aa"},
                "targets": [{"ip": "192.168.1.20", "mac": "bb:bb:bb:bb:bb:bb"}],
                "https": "observe",
                "throttle": {"downloadKbps": 128}
            }"#,
        )
        .unwrap();
        assert_eq!(options.proxy_port, 8888);
        assert_eq!(options.https, HttpsChoice::Observe);
        assert_eq!(options.throttle.download_kbps, 128);
        assert_eq!(options.throttle.upload_kbps, 0);
        assert!(options.throttle.is_enabled());
        assert_eq!(options.targets.len(), 1);
    }

    #[test]
    fn test_resource_state_serialization() {
        let json = serde_json::to_string(&ResourceState::Degraded("static ARP entries".into())).unwrap();
        assert_eq!(json, r#"{"state":"degraded","reason":"static ARP entries"}"#);
        assert_eq!(
            serde_json::to_string(&ResourceState::Running).unwrap(),
            r#"{"state":"running"}"#
        );
    }

    #[test]
    fn test_status_when_stopped() {
        let status = MitmStatus::default();
        assert_eq!(status.state, ControllerState::Stopped);
        assert!(status.plan.is_none());
        assert!(!status.resources.proxy.is_active());
    }

    #[tokio::test]
    async fn test_stalled_stop_aborts_component() {
        use crate::driver::MemoryDriver;
        use crate::events::SessionRecorder;
        use crate::store::MemoryStore;

        let driver = MemoryDriver::new();
        let config = MonitorConfig {
            targets: vec![Ipv4Addr::new(192, 168, 1, 20)],
            ..Default::default()
        };
        let monitor = FlowMonitor::start(
            config,
            Arc::new(driver.clone()),
            SessionRecorder::new(Arc::new(MemoryStore::new())),
        )
        .unwrap();
        assert_eq!(driver.open_handles(), 1);

        let task = monitor.abort_handle();
        let watch = monitor.abort_handle();
        bounded_within(
            "Flow monitor stop",
            Duration::from_millis(50),
            std::future::pending::<()>(),
            Some(task),
        )
        .await;

        for _ in 0..100 {
            if watch.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(watch.is_finished());
        assert_eq!(driver.open_handles(), 0);
        drop(monitor);
    }

    #[tokio::test]
    async fn test_failed_add_target_is_not_listed() {
        use crate::driver::{MemoryDriver, MemoryLink};
        use crate::events::SessionRecorder;
        use crate::os::RecordingNetwork;
        use crate::store::MemoryStore;
        use pnet::util::MacAddr;

        let mac = MacAddr(0x02, 0, 0, 0, 0, 0x01);
        let host = |last: u8| Host::new(Ipv4Addr::new(192, 168, 1, last), MacAddr(0x02, 0, 0, 0, 1, last));
        let store = Arc::new(MemoryStore::new());
        let services = ProxyServices::new(store.clone(), SessionRecorder::new(store));
        let mut controller = MitmController::new(
            Arc::new(RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), mac)),
            Arc::new(MemoryLink::new(mac)),
            Some(Arc::new(MemoryDriver::new())),
            services,
        );
        controller
            .start(MitmOptions {
                interface: "eth0".to_string(),
                gateway: Some(host(1)),
                targets: vec![host(20)],
                proxy_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                proxy_port: 0,
                ..Default::default()
            })
            .await
            .unwrap();

        // kill the spoofer task so it stops taking commands
        let task = controller
            .session
            .as_ref()
            .and_then(|s| s.spoofer.as_ref())
            .map(|s| s.abort_handle())
            .unwrap();
        task.abort();
        while !task.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(controller.add_target(host(21)).await.is_err());
        assert_eq!(controller.status().targets, vec![host(20)]);
        controller.stop().await;
    }
}
