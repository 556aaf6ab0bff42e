//! StateStore — redb-backed state persistence for FleetGrid.
//!
//! Provides typed CRUD operations over devices, workloads, and executable
//! artifacts. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(EXECUTABLES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device record.
    pub fn put_device(&self, device: &DeviceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(device).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(device.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a device by its id.
    pub fn get_device(&self, device_id: &str) -> StateResult<Option<DeviceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(device_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let device: DeviceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// List all known devices, online and offline.
    pub fn list_devices(&self) -> StateResult<Vec<DeviceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let device: DeviceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(device);
        }
        Ok(results)
    }

    /// Delete a device by id. Returns true if it existed.
    ///
    /// Heartbeat-lost devices are marked offline, not deleted; this is for
    /// explicit decommissioning only.
    pub fn delete_device(&self, device_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            existed = table.remove(device_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%device_id, existed, "device deleted");
        Ok(existed)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload record.
    pub fn put_workload(&self, workload: &WorkloadRecord) -> StateResult<()> {
        let value = serde_json::to_vec(workload).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            table
                .insert(workload.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a workload by its id.
    pub fn get_workload(&self, workload_id: &str) -> StateResult<Option<WorkloadRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(workload_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: WorkloadRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let workload: WorkloadRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(workload);
        }
        Ok(results)
    }

    /// List workloads currently in the given state.
    pub fn list_workloads_in_state(&self, state: WorkloadState) -> StateResult<Vec<WorkloadRecord>> {
        let all = self.list_workloads()?;
        Ok(all.into_iter().filter(|w| w.state == state).collect())
    }

    /// Delete a workload by id. Returns true if it existed.
    pub fn delete_workload(&self, workload_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            existed = table.remove(workload_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Executables ────────────────────────────────────────────────

    /// Insert or update an executable artifact.
    pub fn put_executable(&self, exe: &ExecutableRecord) -> StateResult<()> {
        let key = exe.table_key();
        let value = serde_json::to_vec(exe).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EXECUTABLES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, bytes = exe.payload.len(), "executable stored");
        Ok(())
    }

    /// Get a specific version of an executable.
    pub fn get_executable(&self, exe_ref: &ExecutableRef) -> StateResult<Option<ExecutableRecord>> {
        let key = exe_ref.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTABLES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let exe: ExecutableRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(exe))
            }
            None => Ok(None),
        }
    }

    /// List all stored versions of an executable (by key prefix scan).
    pub fn list_executable_versions(&self, exe_id: &str) -> StateResult<Vec<ExecutableRecord>> {
        let prefix = format!("{exe_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTABLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let exe: ExecutableRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(exe);
            }
        }
        Ok(results)
    }

    /// Delete one version of an executable. Returns true if it existed.
    pub fn delete_executable(&self, exe_ref: &ExecutableRef) -> StateResult<bool> {
        let key = exe_ref.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(EXECUTABLES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
