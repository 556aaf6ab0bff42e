//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of devices, compute workloads,
//! and executable artifacts. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable, device-generated identifier. Immutable for the device's lifetime.
pub type DeviceId = String;

/// Unique identifier for a compute workload.
pub type WorkloadId = String;

/// Unique identifier for an executable artifact (code or model).
pub type ExecutableId = String;

// ── Resources ─────────────────────────────────────────────────────

/// A resource quantity across the three scheduled dimensions.
///
/// Used both for device capacity (total/committed) and for workload
/// requests. Fields are unsigned, so "all fields ≥ 0" holds by construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceSpec {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub gpu_count: u32,
}

impl ResourceSpec {
    /// All-zero resources.
    pub const ZERO: ResourceSpec = ResourceSpec {
        cpu_cores: 0,
        memory_bytes: 0,
        gpu_count: 0,
    };

    pub fn new(cpu_cores: u32, memory_bytes: u64, gpu_count: u32) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            gpu_count,
        }
    }

    /// True if `self` fits within `other` in every dimension.
    pub fn fits_within(&self, other: &ResourceSpec) -> bool {
        self.cpu_cores <= other.cpu_cores
            && self.memory_bytes <= other.memory_bytes
            && self.gpu_count <= other.gpu_count
    }

    /// Dimension-wise subtraction, clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }

    /// Dimension-wise addition, clamped at the numeric maximum.
    pub fn saturating_add(&self, other: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpu_count: self.gpu_count.saturating_add(other.gpu_count),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceSpec::ZERO
    }
}

// ── Device ────────────────────────────────────────────────────────

/// Orthogonal role flags for a device.
///
/// A single physical device may hold multiple roles at once (a controller
/// can also run compute workloads), so roles are flags rather than a
/// type hierarchy. Devices default to no roles; compute must be opted
/// into explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceRoles {
    /// Has sensors and/or actuators (non-empty I/O capability list).
    pub has_io: bool,
    /// Accepts compute workloads.
    pub is_compute: bool,
    /// Runs the automation graph and submits workloads.
    pub is_controller: bool,
}

/// Liveness state of a device, derived from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    Offline,
}

/// A device in the fleet.
///
/// Records are retained when a device goes offline (historical accounting);
/// only the liveness state flips. Labels and resources are refreshed from
/// device-origin heartbeats, never guessed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Mutable display name; the id is what never changes.
    pub name: String,
    pub roles: DeviceRoles,
    /// Total resources the device reports.
    pub resources: ResourceSpec,
    /// Arbitrary labels for scheduling affinity.
    pub labels: HashMap<String, String>,
    pub liveness: Liveness,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub last_heartbeat: u64,
}

impl DeviceRecord {
    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }
}

/// One entry of a device's published I/O capability list.
///
/// Capability lists are published as full replacements (a USB unplug can
/// remove entries atomically), so subscribers reconcile by diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoCapability {
    /// Stable id of the sensor/actuator within the device.
    pub id: String,
    /// Capability kind, e.g. "camera", "microphone", "relay".
    pub kind: String,
    /// Free-form capability detail (resolutions, ranges, ...).
    pub detail: String,
}

// ── Workload ──────────────────────────────────────────────────────

/// Placement constraints for a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Affinity {
    /// Pin to a specific device. Overrides label matching when set.
    #[serde(default)]
    pub node_selector: Option<DeviceId>,
    /// Required label matches; every pair must hold on the device.
    #[serde(default)]
    pub node_affinity: HashMap<String, String>,
}

impl Affinity {
    /// No constraints: any compute device qualifies.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn pinned(device_id: impl Into<DeviceId>) -> Self {
        Self {
            node_selector: Some(device_id.into()),
            node_affinity: HashMap::new(),
        }
    }
}

/// Reference to a versioned executable artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExecutableRef {
    pub id: ExecutableId,
    pub version: u32,
}

impl ExecutableRef {
    /// Build the composite key for the executables table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.id, self.version)
    }
}

/// A versioned executable artifact owned by the controller that created it.
///
/// Compute devices hold cached copies keyed by `(id, version)`; those
/// caches are advisory and may be evicted when unreferenced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutableRecord {
    pub id: ExecutableId,
    pub version: u32,
    /// Format tag, e.g. "python", "wasm", "onnx".
    pub format: String,
    /// Opaque artifact bytes.
    pub payload: Vec<u8>,
}

impl ExecutableRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.id, self.version)
    }

    pub fn to_ref(&self) -> ExecutableRef {
        ExecutableRef {
            id: self.id.clone(),
            version: self.version,
        }
    }
}

/// Terminal failure classification surfaced to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No device's total capacity could ever meet the request.
    Unsatisfiable,
    /// Artifact staging failed on every attempted device.
    StagingFailed,
    /// The device reported execution failure, or a deadline elapsed.
    ExecutionFailed,
    /// The assigned device fell offline past the grace period.
    DeviceLost,
}

/// Lifecycle state of a compute workload.
///
/// `Pending → Staging → Running → Completed/Failed`, with a detour through
/// `Queued` when no device currently qualifies. Any non-terminal state can
/// move to `Cancelled`. Terminal states are never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkloadState {
    Pending,
    Queued,
    Staging,
    Running,
    Completed,
    Failed { reason: FailureReason },
    Cancelled,
}

impl WorkloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadState::Completed | WorkloadState::Failed { .. } | WorkloadState::Cancelled
        )
    }
}

/// A compute workload submitted from a controller.
///
/// Mutated only by the scheduler once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadRecord {
    pub id: WorkloadId,
    pub executable: ExecutableRef,
    pub request: ResourceSpec,
    pub affinity: Affinity,
    /// Unix timestamp (seconds) at submission; orders the queue.
    pub submitted_at: u64,
    pub state: WorkloadState,
    /// Device holding the reservation while Staging/Running.
    pub assigned_device: Option<DeviceId>,
    /// Staging attempts consumed so far.
    pub staging_retries: u32,
    /// Configured staging+execution deadline in seconds, if any.
    pub deadline_secs: Option<u64>,
    /// Absolute deadline, set when the workload enters Staging.
    pub deadline_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_fits_within() {
        let small = ResourceSpec::new(1, 256, 0);
        let large = ResourceSpec::new(4, 1024, 1);

        assert!(small.fits_within(&large));
        assert!(!large.fits_within(&small));
        assert!(small.fits_within(&small));
    }

    #[test]
    fn resource_fits_checks_every_dimension() {
        let req = ResourceSpec::new(1, 256, 2);
        let free = ResourceSpec::new(8, 4096, 1); // Plenty of CPU/mem, short on GPU.

        assert!(!req.fits_within(&free));
    }

    #[test]
    fn resource_saturating_sub_clamps() {
        let a = ResourceSpec::new(1, 100, 0);
        let b = ResourceSpec::new(2, 50, 1);

        let diff = a.saturating_sub(&b);
        assert_eq!(diff, ResourceSpec::new(0, 50, 0));
    }

    #[test]
    fn zero_resources() {
        assert!(ResourceSpec::ZERO.is_zero());
        assert!(!ResourceSpec::new(0, 1, 0).is_zero());
        assert!(ResourceSpec::ZERO.fits_within(&ResourceSpec::ZERO));
    }

    #[test]
    fn workload_state_terminality() {
        assert!(!WorkloadState::Pending.is_terminal());
        assert!(!WorkloadState::Queued.is_terminal());
        assert!(!WorkloadState::Staging.is_terminal());
        assert!(!WorkloadState::Running.is_terminal());
        assert!(WorkloadState::Completed.is_terminal());
        assert!(
            WorkloadState::Failed {
                reason: FailureReason::Unsatisfiable
            }
            .is_terminal()
        );
        assert!(WorkloadState::Cancelled.is_terminal());
    }

    #[test]
    fn executable_composite_key() {
        let exe = ExecutableRef {
            id: "detect-people".to_string(),
            version: 3,
        };
        assert_eq!(exe.table_key(), "detect-people:3");
    }

    #[test]
    fn affinity_roundtrips_with_defaults() {
        let json = "{}";
        let affinity: Affinity = serde_json::from_str(json).unwrap();
        assert!(affinity.node_selector.is_none());
        assert!(affinity.node_affinity.is_empty());
    }
}
