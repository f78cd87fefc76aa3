use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use pnet::util::MacAddr;

use packet_forge::arp::ArpBackend;
use packet_forge::controller::{
    ControllerState, HttpsChoice, MitmController, MitmOptions, ResourceState, ThrottleOptions,
};
use packet_forge::driver::{CaptureDriver, MemoryDriver, MemoryLink};
use packet_forge::events::{self, MitmEvent, SessionRecorder};
use packet_forge::network::Host;
use packet_forge::os::RecordingNetwork;
use packet_forge::proxy::ProxyServices;
use packet_forge::redirect::RedirectMode;
use packet_forge::store::MemoryStore;
use packet_forge::Error;

const LOCAL_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);

fn host(last: u8) -> Host {
    Host::new(Ipv4Addr::new(192, 168, 1, last), MacAddr(0x02, 0, 0, 0, 1, last))
}

fn options() -> MitmOptions {
    MitmOptions {
        interface: "eth0".to_string(),
        gateway: Some(host(1)),
        targets: vec![host(20)],
        proxy_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        proxy_port: 0,
        ..Default::default()
    }
}

struct Harness {
    controller: MitmController,
    driver: MemoryDriver,
    link: MemoryLink,
    os: Arc<RecordingNetwork>,
    recorder: SessionRecorder,
}

fn harness_with(os: RecordingNetwork, with_driver: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let recorder = SessionRecorder::new(store.clone());
    let services = ProxyServices::new(store, recorder.clone());
    let driver = MemoryDriver::new();
    let link = MemoryLink::new(LOCAL_MAC);
    let os = Arc::new(os);
    let capture: Option<Arc<dyn CaptureDriver>> = if with_driver {
        Some(Arc::new(driver.clone()))
    } else {
        None
    };
    let controller = MitmController::new(os.clone(), Arc::new(link.clone()), capture, services);
    Harness {
        controller,
        driver,
        link,
        os,
        recorder,
    }
}

fn harness() -> Harness {
    harness_with(RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), LOCAL_MAC), true)
}

#[tokio::test]
async fn test_start_and_stop() {
    let mut h = harness();
    let status = h.controller.start(options()).await.unwrap();

    assert!(h.controller.is_running());
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(status.resources.proxy, ResourceState::Running);
    assert_eq!(status.resources.forwarding, ResourceState::Running);
    assert_eq!(status.resources.redirector, ResourceState::Running);
    assert_eq!(status.resources.monitor, ResourceState::Running);
    assert_eq!(status.resources.spoofer, ResourceState::Running);
    assert_eq!(status.resources.shaper, ResourceState::Stopped);
    assert_eq!(status.redirect_mode, Some(RedirectMode::Driver));
    assert_eq!(status.arp_backend, Some(ArpBackend::Link));
    let proxy_addr = status.proxy_addr.unwrap();
    assert_ne!(proxy_addr.port(), 0);

    // first round of forged replies goes out before start returns
    assert!(!h.link.frames().is_empty());
    assert!(h.driver.open_handles() > 0);

    let status = h.controller.stop().await;
    assert_eq!(status.state, ControllerState::Stopped);
    assert!(!h.controller.is_running());
    assert_eq!(h.driver.open_handles(), 0);
    assert!(tokio::net::TcpStream::connect(proxy_addr).await.is_err());

    let calls = h.os.calls();
    assert!(calls.contains(&"enable_ip_forwarding eth0".to_string()));
    assert!(calls.contains(&"disable_ip_forwarding eth0".to_string()));

    // stopping again is a no-op
    assert_eq!(h.controller.stop().await.state, ControllerState::Stopped);
}

#[tokio::test]
async fn test_start_requires_gateway_and_targets() {
    let mut h = harness();
    let missing_gateway = MitmOptions {
        gateway: None,
        ..options()
    };
    assert!(matches!(
        h.controller.start(missing_gateway).await,
        Err(Error::Config(_))
    ));

    let no_targets = MitmOptions {
        targets: Vec::new(),
        ..options()
    };
    assert!(matches!(h.controller.start(no_targets).await, Err(Error::Config(_))));
    assert!(!h.controller.is_running());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let mut h = harness();
    h.controller.start(options()).await.unwrap();
    assert!(matches!(h.controller.start(options()).await, Err(Error::State(_))));
    h.controller.stop().await;
}

#[tokio::test]
async fn test_unprivileged_start_fails() {
    let mut h = harness_with(
        RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), LOCAL_MAC).unprivileged(),
        true,
    );
    assert!(matches!(
        h.controller.start(options()).await,
        Err(Error::Privilege(_))
    ));
    assert!(!h.os.calls().iter().any(|c| c.starts_with("enable_ip_forwarding")));
}

#[tokio::test]
async fn test_listen_only_runs_without_proxy() {
    let mut h = harness();
    let status = h
        .controller
        .start(MitmOptions {
            http_ports: Some("*".to_string()),
            ..options()
        })
        .await
        .unwrap();

    let plan = status.plan.unwrap();
    assert!(plan.http_listen_only);
    assert!(!plan.has_redirect());
    assert!(plan.monitor_tcp());
    assert_eq!(status.resources.proxy, ResourceState::Stopped);
    assert_eq!(status.resources.redirector, ResourceState::Stopped);
    assert_eq!(status.resources.monitor, ResourceState::Running);
    assert_eq!(status.proxy_addr, None);

    h.controller.stop().await;
}

#[tokio::test]
async fn test_port_forward_fallback_without_driver() {
    let mut h = harness_with(RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), LOCAL_MAC), false);
    let status = h.controller.start(options()).await.unwrap();

    assert!(matches!(status.resources.redirector, ResourceState::Degraded(_)));
    assert_eq!(status.redirect_mode, Some(RedirectMode::PortForward));
    assert!(matches!(status.resources.monitor, ResourceState::Failed(_)));
    let port = status.proxy_addr.unwrap().port();
    assert!(h.os.calls().contains(&format!("add_port_forward 80 {}", port)));

    h.controller.stop().await;
    assert!(h.os.calls().contains(&format!("remove_port_forward 80 {}", port)));
}

#[tokio::test]
async fn test_failed_start_is_torn_down() {
    let mut h = harness_with(
        RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), LOCAL_MAC).without_port_forward(),
        false,
    );
    assert!(h.controller.start(options()).await.is_err());
    assert!(!h.controller.is_running());
    assert!(h.os.calls().contains(&"disable_ip_forwarding eth0".to_string()));
}

#[tokio::test]
async fn test_soft_and_hard_pause() {
    let mut h = harness();
    h.controller
        .start(MitmOptions {
            throttle: ThrottleOptions {
                upload_kbps: 64,
                download_kbps: 128,
            },
            ..options()
        })
        .await
        .unwrap();
    assert_eq!(h.controller.status().resources.shaper, ResourceState::Running);

    let status = h.controller.pause(false).await.unwrap();
    assert_eq!(status.state, ControllerState::Paused);
    assert_eq!(status.resources.shaper, ResourceState::Stopped);
    assert_eq!(status.resources.spoofer, ResourceState::Running);
    assert!(h.recorder.is_paused());

    let status = h.controller.resume().await.unwrap();
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(status.resources.shaper, ResourceState::Running);
    assert!(!h.recorder.is_paused());

    let status = h.controller.pause(true).await.unwrap();
    assert_eq!(status.state, ControllerState::PausedHard);
    assert_eq!(status.resources.spoofer, ResourceState::Stopped);
    assert_eq!(status.resources.proxy, ResourceState::Stopped);
    assert_eq!(status.resources.redirector, ResourceState::Stopped);
    assert_eq!(status.resources.monitor, ResourceState::Stopped);
    assert_eq!(status.resources.forwarding, ResourceState::Running);
    assert_eq!(h.driver.open_handles(), 0);

    // a second pause changes nothing
    assert_eq!(
        h.controller.pause(false).await.unwrap().state,
        ControllerState::PausedHard
    );

    let status = h.controller.resume().await.unwrap();
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(status.resources.proxy, ResourceState::Running);
    assert_eq!(status.resources.spoofer, ResourceState::Running);
    assert_eq!(status.resources.shaper, ResourceState::Running);

    h.controller.stop().await;
    assert_eq!(h.driver.open_handles(), 0);
}

#[tokio::test]
async fn test_pause_requires_session() {
    let mut h = harness();
    assert!(matches!(h.controller.pause(false).await, Err(Error::State(_))));
    assert!(matches!(h.controller.resume().await, Err(Error::State(_))));
    assert!(matches!(h.controller.add_target(host(30)).await, Err(Error::State(_))));
}

#[tokio::test]
async fn test_add_and_remove_targets() {
    let mut h = harness();
    h.controller.start(options()).await.unwrap();

    let status = h.controller.add_target(host(21)).await.unwrap();
    assert_eq!(status.targets.len(), 2);
    let status = h.controller.add_target(host(21)).await.unwrap();
    assert_eq!(status.targets.len(), 2);

    let status = h.controller.remove_target(host(20).ip).await.unwrap();
    assert_eq!(status.targets, vec![host(21)]);
    assert_eq!(status.resources.redirector, ResourceState::Running);

    // unknown targets are ignored
    let status = h.controller.remove_target(Ipv4Addr::new(10, 9, 9, 9)).await.unwrap();
    assert_eq!(status.targets.len(), 1);

    let status = h.controller.remove_target(host(21).ip).await.unwrap();
    assert!(status.targets.is_empty());
    assert_eq!(status.resources.redirector, ResourceState::Stopped);
    assert_eq!(status.resources.monitor, ResourceState::Stopped);

    let status = h.controller.add_target(host(22)).await.unwrap();
    assert_eq!(status.resources.redirector, ResourceState::Running);
    assert_eq!(status.resources.monitor, ResourceState::Running);

    h.controller.stop().await;
}

#[tokio::test]
async fn test_status_events_are_published() {
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = events::channel();
    let services = ProxyServices::new(store.clone(), SessionRecorder::new(store).with_events(tx));
    let mut controller = MitmController::new(
        Arc::new(RecordingNetwork::new(Ipv4Addr::new(192, 168, 1, 5), LOCAL_MAC)),
        Arc::new(MemoryLink::new(LOCAL_MAC)),
        Some(Arc::new(MemoryDriver::new())),
        services,
    );

    controller
        .start(MitmOptions {
            https: HttpsChoice::Observe,
            ..options()
        })
        .await
        .unwrap();
    controller.stop().await;

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let MitmEvent::Status(status) = event {
            states.push(status.state);
        }
    }
    assert_eq!(states, vec![ControllerState::Running, ControllerState::Stopped]);
}
