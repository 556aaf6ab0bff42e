//! Capability hub — pub/sub for device I/O capability lists.
//!
//! A device publishes its full capability list on any change (capabilities
//! can appear and disappear atomically, e.g. a USB unplug), and subscribers
//! reconcile by diffing the replacement against what they last saw. No
//! incremental patching.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::debug;

use fleetgrid_state::{DeviceId, IoCapability};

/// Fans out full-replacement capability lists per device.
///
/// Subscribing to a device that has not published yet yields an empty list
/// until the first publish arrives.
pub struct CapabilityHub {
    channels: RwLock<HashMap<DeviceId, watch::Sender<Vec<IoCapability>>>>,
}

impl CapabilityHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn channel(&self, device_id: &str) -> watch::Sender<Vec<IoCapability>> {
        if let Some(tx) = self.channels.read().expect("hub lock poisoned").get(device_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().expect("hub lock poisoned");
        channels
            .entry(device_id.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .clone()
    }

    /// Publish a device's capability list, replacing the previous one.
    pub fn publish(&self, device_id: &str, capabilities: Vec<IoCapability>) {
        let tx = self.channel(device_id);
        debug!(%device_id, count = capabilities.len(), "capabilities published");
        tx.send_replace(capabilities);
    }

    /// Subscribe to a device's capability list.
    pub fn subscribe(&self, device_id: &str) -> watch::Receiver<Vec<IoCapability>> {
        self.channel(device_id).subscribe()
    }

    /// The device's current capability list.
    pub fn current(&self, device_id: &str) -> Vec<IoCapability> {
        self.channel(device_id).borrow().clone()
    }
}

impl Default for CapabilityHub {
    fn default() -> Self {
        Self::new()
    }
}
