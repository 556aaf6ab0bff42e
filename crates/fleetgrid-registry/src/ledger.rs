//! Resource ledger — per-device bookkeeping of total vs. committed resources.
//!
//! `reserve` either commits a request in full or mutates nothing; `release`
//! always succeeds and clamps at zero. Each device's entry sits behind its
//! own mutex, so operations on one device never contend with another's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use fleetgrid_state::{DeviceId, ResourceSpec};

/// Accounting for a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Resources the device reports in total.
    pub total: ResourceSpec,
    /// Resources currently committed to workloads.
    pub committed: ResourceSpec,
}

impl LedgerEntry {
    /// Uncommitted resources. Never negative in any dimension.
    pub fn free(&self) -> ResourceSpec {
        self.total.saturating_sub(&self.committed)
    }
}

/// Per-device resource accounting for the whole fleet.
///
/// The map is guarded by an `RwLock` for membership changes only; the
/// entries themselves are individually locked, which serializes
/// reserve/release/read per device without a fleet-wide lock.
pub struct ResourceLedger {
    entries: RwLock<HashMap<DeviceId, Arc<Mutex<LedgerEntry>>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry_handle(&self, device_id: &str) -> Option<Arc<Mutex<LedgerEntry>>> {
        let entries = self.entries.read().expect("ledger lock poisoned");
        entries.get(device_id).cloned()
    }

    /// Create or refresh a device's total capacity. Commitments are kept.
    ///
    /// Called from heartbeats: a device may legitimately report a smaller
    /// total than what is currently committed (hardware removed); in that
    /// case free clamps to zero and the mismatch is logged.
    pub fn set_total(&self, device_id: &str, total: ResourceSpec) {
        let handle = {
            let mut entries = self.entries.write().expect("ledger lock poisoned");
            entries
                .entry(device_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(LedgerEntry {
                        total,
                        committed: ResourceSpec::ZERO,
                    }))
                })
                .clone()
        };
        let mut entry = handle.lock().expect("ledger entry lock poisoned");
        if !entry.committed.fits_within(&total) {
            warn!(
                %device_id,
                ?total,
                committed = ?entry.committed,
                "device reported total below committed resources"
            );
        }
        entry.total = total;
    }

    /// Atomically reserve `request` against the device's free resources.
    ///
    /// Succeeds only if no dimension would go negative; on failure nothing
    /// is mutated. Unknown devices always fail.
    pub fn reserve(&self, device_id: &str, request: &ResourceSpec) -> bool {
        let Some(handle) = self.entry_handle(device_id) else {
            return false;
        };
        let mut entry = handle.lock().expect("ledger entry lock poisoned");
        if !request.fits_within(&entry.free()) {
            return false;
        }
        entry.committed = entry.committed.saturating_add(request);
        debug!(%device_id, ?request, free = ?entry.free(), "resources reserved");
        true
    }

    /// Release a previous reservation, clamping committed at zero.
    ///
    /// A release larger than what is committed indicates a double release
    /// somewhere; it is tolerated but logged as an inconsistency.
    pub fn release(&self, device_id: &str, request: &ResourceSpec) {
        let Some(handle) = self.entry_handle(device_id) else {
            warn!(%device_id, "release for unknown device");
            return;
        };
        let mut entry = handle.lock().expect("ledger entry lock poisoned");
        if !request.fits_within(&entry.committed) {
            warn!(
                %device_id,
                ?request,
                committed = ?entry.committed,
                "release exceeds committed resources, clamping"
            );
        }
        entry.committed = entry.committed.saturating_sub(request);
        debug!(%device_id, ?request, free = ?entry.free(), "resources released");
    }

    /// Free resources of a device, if known.
    pub fn free_of(&self, device_id: &str) -> Option<ResourceSpec> {
        let handle = self.entry_handle(device_id)?;
        let entry = handle.lock().expect("ledger entry lock poisoned");
        Some(entry.free())
    }

    /// Point-in-time copy of a device's entry.
    pub fn entry(&self, device_id: &str) -> Option<LedgerEntry> {
        let handle = self.entry_handle(device_id)?;
        let entry = handle.lock().expect("ledger entry lock poisoned");
        Some(*entry)
    }

    /// Drop a device from the ledger (explicit decommission only).
    pub fn remove(&self, device_id: &str) -> bool {
        let mut entries = self.entries.write().expect("ledger lock poisoned");
        entries.remove(device_id).is_some()
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.entries.read().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}
