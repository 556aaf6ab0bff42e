//! Device registry — tracks fleet membership and liveness.
//!
//! Devices announce themselves with heartbeats carrying their id, roles,
//! labels, and total resources. The registry persists records via the
//! state store, mirrors totals into the resource ledger, and broadcasts
//! liveness transitions so the scheduler can re-drain its queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleetgrid_state::*;

use crate::ledger::ResourceLedger;

/// Liveness transition broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Device joined or came back from offline.
    DeviceOnline(DeviceId),
    /// Heartbeat deadline elapsed.
    DeviceOffline(DeviceId),
}

/// Payload of a device heartbeat. Idempotent: repeating the same heartbeat
/// only refreshes the liveness timestamp.
#[derive(Debug, Clone)]
pub struct DeviceHeartbeat {
    /// Device-generated stable id.
    pub device_id: DeviceId,
    /// Display name, stored on the device itself.
    pub name: String,
    pub roles: DeviceRoles,
    /// Total resources the device reports.
    pub resources: ResourceSpec,
    pub labels: HashMap<String, String>,
}

/// Tracks devices, their labels, and their ledger entries.
///
/// Owns device liveness exclusively: liveness is refreshed only from
/// device-origin heartbeats, never guessed. Offline devices are retained
/// (records and ledger entries) for historical accounting.
pub struct DeviceRegistry {
    state: StateStore,
    ledger: Arc<ResourceLedger>,
    /// Heartbeat silence after which a device is marked offline.
    offline_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new registry over the given store and ledger.
    pub fn new(state: StateStore, ledger: Arc<ResourceLedger>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state,
            ledger,
            offline_timeout: Duration::from_secs(30),
            events,
        }
    }

    /// Set the heartbeat deadline.
    pub fn with_offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    /// Subscribe to liveness transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Shared handle to the resource ledger.
    pub fn ledger(&self) -> Arc<ResourceLedger> {
        self.ledger.clone()
    }

    /// Process a device heartbeat — creates the device on first sight,
    /// otherwise refreshes resources, labels, and the liveness timestamp.
    pub fn upsert(&self, heartbeat: DeviceHeartbeat) -> StateResult<()> {
        let existing = self.state.get_device(&heartbeat.device_id)?;
        let came_online = match &existing {
            Some(record) => !record.is_online(),
            None => true,
        };

        let record = DeviceRecord {
            id: heartbeat.device_id.clone(),
            name: heartbeat.name,
            roles: heartbeat.roles,
            resources: heartbeat.resources,
            labels: heartbeat.labels,
            liveness: Liveness::Online,
            last_heartbeat: epoch_secs(),
        };
        self.state.put_device(&record)?;
        self.ledger.set_total(&record.id, record.resources);

        if came_online {
            info!(device_id = %record.id, name = %record.name, "device online");
            let _ = self.events.send(RegistryEvent::DeviceOnline(record.id));
        } else {
            debug!(device_id = %record.id, "heartbeat received");
        }
        Ok(())
    }

    /// Mark a device offline. The record and its ledger entry are retained;
    /// in-flight workloads committed on it are not auto-cancelled.
    pub fn mark_offline(&self, device_id: &str) -> StateResult<bool> {
        match self.state.get_device(device_id)? {
            Some(mut record) if record.is_online() => {
                record.liveness = Liveness::Offline;
                self.state.put_device(&record)?;
                warn!(%device_id, "device offline");
                let _ = self
                    .events
                    .send(RegistryEvent::DeviceOffline(device_id.to_string()));
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    /// Mark every device whose heartbeat deadline elapsed as offline.
    ///
    /// Returns the ids that transitioned.
    pub fn sweep_offline(&self) -> StateResult<Vec<DeviceId>> {
        let now = epoch_secs();
        let deadline = self.offline_timeout.as_secs();
        let mut transitioned = Vec::new();

        for device in self.state.list_devices()? {
            if device.is_online() && now.saturating_sub(device.last_heartbeat) > deadline {
                if self.mark_offline(&device.id)? {
                    transitioned.push(device.id);
                }
            }
        }
        Ok(transitioned)
    }

    /// Point-in-time snapshot of all device records.
    ///
    /// The snapshot is a copy, never a live view: concurrent heartbeats
    /// during iteration cannot corrupt it.
    pub fn snapshot(&self) -> StateResult<Vec<DeviceRecord>> {
        self.state.list_devices()
    }

    /// Get a single device by id.
    pub fn get(&self, device_id: &str) -> StateResult<Option<DeviceRecord>> {
        self.state.get_device(device_id)
    }

    /// Change a device's display name. The id is immutable.
    pub fn rename(&self, device_id: &str, name: &str) -> StateResult<bool> {
        match self.state.get_device(device_id)? {
            Some(mut record) => {
                record.name = name.to_string();
                self.state.put_device(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Count of online devices.
    pub fn online_count(&self) -> StateResult<usize> {
        Ok(self
            .state
            .list_devices()?
            .iter()
            .filter(|d| d.is_online())
            .count())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
