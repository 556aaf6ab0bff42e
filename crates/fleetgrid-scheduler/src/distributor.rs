//! Distributor and dispatcher seams — the scheduler's view of device
//! transports.
//!
//! Artifact transfer and execution control live outside this crate; the
//! scheduler only needs "make sure the executable is on the device" and
//! "start/cancel this workload". `CachedDistributor` layers the per-device
//! staging cache on top of any transport so repeat staging of the same
//! `(executable, version)` pair is a no-op.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use fleetgrid_state::{DeviceId, ExecutableRef};

/// Ensures a workload's executable artifact is staged on a device before
/// the device is asked to run it.
#[async_trait]
pub trait ExecutableDistributor: Send + Sync {
    /// Stage `executable` on the device. Idempotent: staging an artifact
    /// the device already holds must succeed without a transfer.
    async fn ensure_staged(&self, device_id: &str, executable: &ExecutableRef)
    -> anyhow::Result<()>;
}

/// Starts and cancels workload execution on devices.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Ask the device to begin executing the workload.
    async fn dispatch(&self, device_id: &str, workload_id: &str) -> anyhow::Result<()>;

    /// Best-effort cancel signal. The device's own completion report stays
    /// authoritative and may still arrive afterwards.
    async fn cancel(&self, device_id: &str, workload_id: &str);
}

/// Tracks which `(device, executable, version)` triples are already staged
/// and skips the inner transport for those.
///
/// Cache entries are advisory; eviction (device decommission, artifact
/// cleanup) just causes one redundant transfer.
pub struct CachedDistributor<T> {
    inner: T,
    staged: Mutex<HashSet<(DeviceId, String)>>,
}

impl<T> CachedDistributor<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            staged: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the device already holds this executable version.
    pub fn is_staged(&self, device_id: &str, executable: &ExecutableRef) -> bool {
        self.staged
            .lock()
            .expect("staging cache lock poisoned")
            .contains(&(device_id.to_string(), executable.table_key()))
    }

    /// Forget everything staged on a device.
    pub fn evict_device(&self, device_id: &str) {
        self.staged
            .lock()
            .expect("staging cache lock poisoned")
            .retain(|(dev, _)| dev != device_id);
    }

    /// Forget one staged artifact on a device.
    pub fn evict(&self, device_id: &str, executable: &ExecutableRef) -> bool {
        self.staged
            .lock()
            .expect("staging cache lock poisoned")
            .remove(&(device_id.to_string(), executable.table_key()))
    }
}

#[async_trait]
impl<T: ExecutableDistributor> ExecutableDistributor for CachedDistributor<T> {
    async fn ensure_staged(
        &self,
        device_id: &str,
        executable: &ExecutableRef,
    ) -> anyhow::Result<()> {
        let key = (device_id.to_string(), executable.table_key());
        if self
            .staged
            .lock()
            .expect("staging cache lock poisoned")
            .contains(&key)
        {
            debug!(%device_id, executable = %key.1, "already staged, skipping transfer");
            return Ok(());
        }

        self.inner.ensure_staged(device_id, executable).await?;

        self.staged
            .lock()
            .expect("staging cache lock poisoned")
            .insert(key);
        Ok(())
    }
}
