// src/shaper.rs

//! Per-target bandwidth limiting.
//!
//! Every `(target, direction)` pair gets a token bucket holding one second
//! worth of its rate and a bounded FIFO queue. Packets that find tokens and
//! an empty queue are released at once; the rest wait for the flush loop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};

use crate::driver::{self, CaptureDriver, CaptureHandle, CapturedPacket, Filter, OpenMode, PacketMeta};
use crate::error::{Error, Result};
use crate::packet;

pub const MAX_QUEUE_PACKETS: usize = 2000;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(20);
pub const MAX_RELEASE_PER_TICK: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaperConfig {
    pub targets: Vec<Ipv4Addr>,
    /// Zero disables shaping of that direction
    pub upload_kbps: u64,
    pub download_kbps: u64,
}

impl ShaperConfig {
    pub fn is_enabled(&self) -> bool {
        self.upload_kbps > 0 || self.download_kbps > 0
    }

    /// Bytes per second for `direction`.
    pub fn rate(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upload => self.upload_kbps * 1024,
            Direction::Download => self.download_kbps * 1024,
        }
    }

    pub fn filter(&self) -> Result<Filter> {
        let hosts = Filter::any_host(&self.targets)
            .ok_or_else(|| Error::config("No targets configured for shaping"))?;
        Ok(Filter::And(vec![
            Filter::Ip,
            Filter::not(Filter::Impostor),
            Filter::not(Filter::Loopback),
            hosts,
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the target
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Continuous-refill token bucket with a capacity of one second of rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket for `rate` bytes per second.
    pub fn new(rate: u64, now: Instant) -> Self {
        let rate = rate as f64;
        TokenBucket {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + self.rate * elapsed.as_secs_f64()).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes `bytes` tokens if available.
    ///
    /// A packet larger than the whole bucket would never fit, so it goes
    /// through once the bucket is full and leaves it empty.
    pub fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let bytes = bytes as f64;
        if self.tokens >= bytes {
            self.tokens -= bytes;
            return true;
        }
        if bytes > self.capacity && self.tokens >= self.capacity {
            self.tokens = 0.0;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperStats {
    pub queued: usize,
    pub sent: u64,
    pub dropped: u64,
}

/// What happened to a packet handed to [`ShaperCore::offer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    /// Send it now
    Release(CapturedPacket),
    Queued,
    Dropped,
}

pub type QueueKey = (Ipv4Addr, Direction);

/// Buckets, queues and counters, without any I/O.
pub struct ShaperCore {
    targets: Vec<Ipv4Addr>,
    upload: u64,
    download: u64,
    buckets: HashMap<QueueKey, TokenBucket>,
    queues: HashMap<QueueKey, VecDeque<CapturedPacket>>,
    stats: ShaperStats,
}

impl ShaperCore {
    pub fn new(config: &ShaperConfig) -> Self {
        ShaperCore {
            targets: config.targets.clone(),
            upload: config.rate(Direction::Upload),
            download: config.rate(Direction::Download),
            buckets: HashMap::new(),
            queues: HashMap::new(),
            stats: ShaperStats::default(),
        }
    }

    fn rate(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upload => self.upload,
            Direction::Download => self.download,
        }
    }

    /// The target a packet belongs to and which way it travels.
    pub fn classify(&self, data: &[u8]) -> Option<QueueKey> {
        let ip = packet::parse_ipv4(data).ok()?;
        if self.targets.contains(&ip.src) {
            Some((ip.src, Direction::Upload))
        } else if self.targets.contains(&ip.dst) {
            Some((ip.dst, Direction::Download))
        } else {
            None
        }
    }

    pub fn offer(&mut self, packet: CapturedPacket, now: Instant) -> Offer {
        if packet.meta.loopback || packet.meta.impostor {
            return self.release(packet);
        }
        let Some(key) = self.classify(&packet.data) else {
            if packet::parse_ipv4(&packet.data).is_err() {
                trace!("Dropping unparsable packet");
                self.stats.dropped += 1;
                return Offer::Dropped;
            }
            return self.release(packet);
        };

        let rate = self.rate(key.1);
        if rate == 0 {
            return self.release(packet);
        }

        let queue = self.queues.entry(key).or_default();
        if queue.len() >= MAX_QUEUE_PACKETS {
            self.stats.dropped += 1;
            return Offer::Dropped;
        }
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(rate, now));
        if queue.is_empty() && bucket.try_consume(packet.data.len(), now) {
            return self.release(packet);
        }
        queue.push_back(packet);
        self.stats.queued += 1;
        Offer::Queued
    }

    fn release(&mut self, packet: CapturedPacket) -> Offer {
        self.stats.sent += 1;
        Offer::Release(packet)
    }

    /// Releases queued packets the buckets now have room for, at most
    /// [`MAX_RELEASE_PER_TICK`] per queue.
    pub fn flush(&mut self, now: Instant) -> Vec<CapturedPacket> {
        let mut out = Vec::new();
        for (key, queue) in self.queues.iter_mut() {
            let Some(bucket) = self.buckets.get_mut(key) else {
                continue;
            };
            let mut released = 0;
            while released < MAX_RELEASE_PER_TICK {
                let Some(front) = queue.front() else {
                    break;
                };
                if !bucket.try_consume(front.data.len(), now) {
                    break;
                }
                if let Some(packet) = queue.pop_front() {
                    out.push(packet);
                }
                released += 1;
            }
        }
        self.stats.sent += out.len() as u64;
        self.stats.queued = self.queues.values().map(VecDeque::len).sum();
        out
    }

    /// Counts a packet that was released but could not be sent.
    pub fn send_failed(&mut self) {
        self.stats.sent = self.stats.sent.saturating_sub(1);
        self.stats.dropped += 1;
    }

    pub fn stats(&self) -> ShaperStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
        self.queues.clear();
        self.stats = ShaperStats::default();
    }
}

/// A running shaper: one divert handle and one processing task.
pub struct TrafficShaper {
    handle: Arc<dyn CaptureHandle>,
    shutdown: watch::Sender<bool>,
    stats: watch::Receiver<ShaperStats>,
    task: JoinHandle<()>,
}

impl TrafficShaper {
    pub fn start(config: ShaperConfig, driver: Arc<dyn CaptureDriver>) -> Result<Self> {
        if !config.is_enabled() {
            return Err(Error::config("No shaping rates configured"));
        }
        if !driver.can_withhold() {
            return Err(Error::DriverUnavailable(format!(
                "the {} driver cannot hold packets back",
                driver.name()
            )));
        }
        let filter = config.filter()?;
        debug!("Shaper filter: {}", filter);

        let handle = driver.open(&filter, OpenMode::Divert)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = driver::spawn_reader("shaper", Arc::clone(&handle), tx, |p| p) {
            handle.close();
            return Err(e.into());
        }

        info!(
            "Shaping {} targets (upload {} KB/s, download {} KB/s)",
            config.targets.len(),
            config.upload_kbps,
            config.download_kbps
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats) = watch::channel(ShaperStats::default());
        let task = tokio::spawn(run(
            ShaperCore::new(&config),
            Arc::clone(&handle),
            rx,
            shutdown_rx,
            stats_tx,
        ));

        Ok(TrafficShaper {
            handle,
            shutdown,
            stats,
            task,
        })
    }

    pub fn stats(&self) -> ShaperStats {
        *self.stats.borrow()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Stops shaping. Packets still queued are discarded.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.handle.close();
        if let Err(e) = self.task.await {
            warn!("Shaper task ended abnormally: {}", e);
        }
        info!("Traffic shaping stopped");
    }
}

fn send(handle: &dyn CaptureHandle, core: &mut ShaperCore, packet: &CapturedPacket) {
    let meta = PacketMeta::reinjected(packet.meta.outbound);
    if let Err(e) = handle.send(&packet.data, &meta) {
        debug!("Shaper failed to send packet: {}", e);
        core.send_failed();
    }
}

async fn run(
    mut core: ShaperCore,
    handle: Arc<dyn CaptureHandle>,
    mut packets: mpsc::UnboundedReceiver<CapturedPacket>,
    mut shutdown: watch::Receiver<bool>,
    stats: watch::Sender<ShaperStats>,
) {
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = packets.recv() => {
                let Some(packet) = packet else { break };
                if let Offer::Release(packet) = core.offer(packet, Instant::now()) {
                    send(handle.as_ref(), &mut core, &packet);
                }
            }
            _ = ticker.tick() => {
                for packet in core.flush(Instant::now()) {
                    send(handle.as_ref(), &mut core, &packet);
                }
            }
        }
        stats.send_replace(core.stats());
    }

    let final_stats = core.stats();
    if final_stats.queued > 0 {
        debug!("Discarding {} queued packets", final_stats.queued);
    }
    core.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::packet::{build_tcp, TCP_ACK};
    use std::net::SocketAddrV4;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn upload(len: usize) -> CapturedPacket {
        let payload = vec![0u8; len.saturating_sub(40)];
        CapturedPacket {
            data: build_tcp(
                SocketAddrV4::new(TARGET, 40000),
                SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443),
                TCP_ACK,
                &payload,
            ),
            meta: PacketMeta::inbound(),
        }
    }

    fn download(len: usize) -> CapturedPacket {
        let payload = vec![0u8; len.saturating_sub(40)];
        CapturedPacket {
            data: build_tcp(
                SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443),
                SocketAddrV4::new(TARGET, 40000),
                TCP_ACK,
                &payload,
            ),
            meta: PacketMeta::outbound(),
        }
    }

    fn config(upload_kbps: u64, download_kbps: u64) -> ShaperConfig {
        ShaperConfig {
            targets: vec![TARGET],
            upload_kbps,
            download_kbps,
        }
    }

    #[test]
    fn test_token_bucket_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000, start);
        assert!(bucket.try_consume(600, start));
        assert!(!bucket.try_consume(600, start));
        assert!(bucket.try_consume(600, start + Duration::from_millis(200)));
        // never above capacity
        bucket.refill(start + Duration::from_secs(10));
        assert_eq!(bucket.tokens(), 1000.0);
    }

    #[test]
    fn test_oversized_packet_needs_full_bucket() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000, start);
        assert!(bucket.try_consume(1500, start));
        assert_eq!(bucket.tokens(), 0.0);
        assert!(!bucket.try_consume(1500, start + Duration::from_millis(500)));
        assert!(bucket.try_consume(1500, start + Duration::from_secs(2)));
    }

    #[test]
    fn test_queue_then_flush_in_order() {
        // 1 KB/s: the bucket holds 1024 bytes
        let mut core = ShaperCore::new(&config(1, 0));
        let start = Instant::now();

        assert!(matches!(core.offer(upload(1000), start), Offer::Release(_)));
        assert_eq!(core.offer(upload(500), start), Offer::Queued);
        assert_eq!(core.offer(upload(100), start), Offer::Queued);
        assert_eq!(core.stats().queued, 2);

        // later packets wait behind the queue even if they would fit
        let later = start + Duration::from_millis(200);
        assert_eq!(core.offer(upload(60), later), Offer::Queued);

        let released = core.flush(start + Duration::from_millis(700));
        assert_eq!(released.len(), 3);
        assert_eq!(released[0].data.len(), 500);
        assert_eq!(released[1].data.len(), 100);
        assert_eq!(released[2].data.len(), 60);
        assert_eq!(core.stats(), ShaperStats { queued: 0, sent: 4, dropped: 0 });
    }

    #[test]
    fn test_zero_rate_direction_passes() {
        let mut core = ShaperCore::new(&config(1, 0));
        let start = Instant::now();
        for _ in 0..10 {
            assert!(matches!(core.offer(download(1400), start), Offer::Release(_)));
        }
    }

    #[test]
    fn test_queue_cap_drops() {
        let mut core = ShaperCore::new(&config(1, 0));
        let start = Instant::now();
        core.offer(upload(1024), start);
        for _ in 0..MAX_QUEUE_PACKETS {
            assert_eq!(core.offer(upload(100), start), Offer::Queued);
        }
        assert_eq!(core.offer(upload(100), start), Offer::Dropped);
        assert_eq!(core.stats().dropped, 1);

        // one tick releases at most the per-tick cap
        let released = core.flush(start + Duration::from_secs(1000));
        assert!(released.len() <= MAX_RELEASE_PER_TICK);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut core = ShaperCore::new(&config(1, 1));
        let garbage = CapturedPacket {
            data: vec![0x45, 0, 0],
            meta: PacketMeta::inbound(),
        };
        assert_eq!(core.offer(garbage, Instant::now()), Offer::Dropped);
        core.reset();
        assert_eq!(core.stats(), ShaperStats::default());
    }

    #[test]
    fn test_disabled_config_is_rejected() {
        let driver = Arc::new(MemoryDriver::new());
        assert!(TrafficShaper::start(config(0, 0), driver).is_err());
    }

    #[tokio::test]
    async fn test_shaper_releases_through_driver() {
        let driver = MemoryDriver::new();
        let shaper = TrafficShaper::start(config(1, 0), Arc::new(driver.clone())).unwrap();

        let first = upload(1000);
        let second = upload(500);
        driver.inject(&first.data, first.meta);
        driver.inject(&second.data, second.meta);

        let sent = driver.wait_sent(1, Duration::from_secs(2)).await;
        assert_eq!(sent[0].data.len(), 1000);
        assert!(sent[0].meta.impostor);

        // the second packet needs roughly half a second of refill
        let sent = driver.wait_sent(2, Duration::from_secs(3)).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].data.len(), 500);

        shaper.stop().await;
        assert_eq!(driver.open_handles(), 0);
    }
}
