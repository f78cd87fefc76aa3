// src/driver/memory.rs

//! In-memory capture driver and link layer.
//!
//! Packets are fed in with [`MemoryDriver::inject`] and everything the
//! components send is kept for inspection. Used by the test-suite and for dry
//! runs without privileges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::trace;
use pnet::util::MacAddr;

use super::{
    CaptureDriver, CaptureHandle, CapturedPacket, Filter, LinkInjector, LinkLayer, OpenMode,
    PacketMeta,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct DriverState {
    handles: Vec<Weak<MemoryHandle>>,
    sent: Vec<CapturedPacket>,
    opened: Vec<(Filter, OpenMode)>,
}

/// Capture driver backed by channels.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a packet to every open sniff handle whose filter matches and
    /// to the first matching divert handle. Returns the number of deliveries.
    pub fn inject(&self, data: &[u8], meta: PacketMeta) -> usize {
        let handles: Vec<Arc<MemoryHandle>> = match self.state.lock() {
            Ok(mut state) => {
                state.handles.retain(|h| h.strong_count() > 0);
                state.handles.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return 0,
        };

        let mut delivered = 0;
        let mut diverted = false;
        for handle in handles {
            if handle.closed.load(Ordering::SeqCst) || !handle.filter.matches(data, &meta) {
                continue;
            }
            if handle.mode == OpenMode::Divert {
                if diverted {
                    continue;
                }
                diverted = true;
            }
            if handle.deliver(CapturedPacket {
                data: data.to_vec(),
                meta,
            }) {
                delivered += 1;
            }
        }
        trace!("Memory driver delivered packet to {} handles", delivered);
        delivered
    }

    /// Everything sent through any handle so far.
    pub fn sent(&self) -> Vec<CapturedPacket> {
        self.state
            .lock()
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.sent.clear();
        }
    }

    /// Waits until at least `count` packets were sent or `timeout` elapses.
    pub async fn wait_sent(&self, count: usize, timeout: Duration) -> Vec<CapturedPacket> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.handles
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|h| !h.closed.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Filters of every handle ever opened, in order.
    pub fn opened_filters(&self) -> Vec<(Filter, OpenMode)> {
        self.state
            .lock()
            .map(|s| s.opened.clone())
            .unwrap_or_default()
    }
}

impl CaptureDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, filter: &Filter, mode: OpenMode) -> Result<Arc<dyn CaptureHandle>> {
        let (tx, rx) = mpsc::channel();
        let handle = Arc::new(MemoryHandle {
            filter: filter.clone(),
            mode,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        });

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::DriverUnavailable("memory driver poisoned".into()))?;
        state.handles.push(Arc::downgrade(&handle));
        state.opened.push((filter.clone(), mode));
        Ok(handle)
    }
}

pub struct MemoryHandle {
    filter: Filter,
    mode: OpenMode,
    tx: Mutex<Option<Sender<CapturedPacket>>>,
    rx: Mutex<Receiver<CapturedPacket>>,
    closed: AtomicBool,
    state: Arc<Mutex<DriverState>>,
}

impl MemoryHandle {
    fn deliver(&self, packet: CapturedPacket) -> bool {
        match self.tx.lock() {
            Ok(tx) => tx.as_ref().is_some_and(|tx| tx.send(packet).is_ok()),
            Err(_) => false,
        }
    }
}

impl CaptureHandle for MemoryHandle {
    fn recv(&self, timeout: Duration) -> Result<Option<CapturedPacket>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DriverUnavailable("handle closed".into()));
        }
        let rx = self
            .rx
            .lock()
            .map_err(|_| Error::DriverUnavailable("handle poisoned".into()))?;
        match rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::DriverUnavailable("handle closed".into()))
            }
        }
    }

    fn send(&self, data: &[u8], meta: &PacketMeta) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DriverUnavailable("handle closed".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::DriverUnavailable("memory driver poisoned".into()))?;
        state.sent.push(CapturedPacket {
            data: data.to_vec(),
            meta: *meta,
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

/// Link layer that records frames instead of putting them on a wire.
#[derive(Clone)]
pub struct MemoryLink {
    mac: Option<MacAddr>,
    available: bool,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryLink {
    pub fn new(mac: MacAddr) -> Self {
        MemoryLink {
            mac: Some(mac),
            available: true,
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A link layer whose injectors cannot be opened but whose interface MAC resolves.
    pub fn unavailable(mac: Option<MacAddr>) -> Self {
        MemoryLink {
            mac,
            available: false,
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
    }
}

impl LinkLayer for MemoryLink {
    fn open(&self, interface: &str) -> Result<Arc<dyn LinkInjector>> {
        match (self.available, self.mac) {
            (true, Some(mac)) => Ok(Arc::new(MemoryInjector {
                mac,
                frames: Arc::clone(&self.frames),
            })),
            _ => Err(Error::DriverUnavailable(format!(
                "no link-layer access on {}",
                interface
            ))),
        }
    }

    fn interface_mac(&self, _interface: &str) -> Option<MacAddr> {
        self.mac
    }
}

struct MemoryInjector {
    mac: MacAddr,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl LinkInjector for MemoryInjector {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.frames
            .lock()
            .map_err(|_| Error::DriverUnavailable("memory link poisoned".into()))?
            .push(frame.to_vec());
        Ok(())
    }
}
