// src/driver/datalink.rs

use std::sync::{Arc, Mutex};

use log::{debug, info};
use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};
use pnet::util::MacAddr;

use super::{LinkInjector, LinkLayer};
use crate::error::{Error, Result};

/// Link-layer access through `pnet::datalink`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnetLink;

impl PnetLink {
    pub fn new() -> Self {
        PnetLink
    }
}

pub(crate) fn find_interface(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.name == name)
}

impl LinkLayer for PnetLink {
    fn open(&self, interface: &str) -> Result<Arc<dyn LinkInjector>> {
        let iface = find_interface(interface)
            .ok_or_else(|| Error::DriverUnavailable(format!("Interface {} not found", interface)))?;
        let mac = iface.mac.ok_or_else(|| {
            Error::DriverUnavailable(format!("Interface {} has no hardware address", interface))
        })?;

        match datalink::channel(&iface, Default::default()) {
            Ok(Channel::Ethernet(tx, _rx)) => {
                info!("Link-layer injector ready on {} ({})", interface, mac);
                Ok(Arc::new(PnetInjector {
                    mac,
                    tx: Mutex::new(tx),
                }))
            }
            Ok(_) => Err(Error::DriverUnavailable(format!(
                "Non-ethernet channel on {}",
                interface
            ))),
            Err(e) => Err(Error::DriverUnavailable(format!(
                "Failed to open datalink channel on {}: {}",
                interface, e
            ))),
        }
    }

    fn interface_mac(&self, interface: &str) -> Option<MacAddr> {
        find_interface(interface).and_then(|i| i.mac)
    }
}

struct PnetInjector {
    mac: MacAddr,
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl LinkInjector for PnetInjector {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut tx = self
            .tx
            .lock()
            .map_err(|_| Error::DriverUnavailable("link sender poisoned".into()))?;
        match tx.send_to(frame, None) {
            Some(Ok(())) => {
                debug!("Injected {} byte frame", frame.len());
                Ok(())
            }
            Some(Err(e)) => Err(Error::Io(e)),
            None => Err(Error::DriverUnavailable("link sender refused frame".into())),
        }
    }
}
