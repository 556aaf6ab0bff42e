//! fleetgrid-scheduler — workload placement and lifecycle orchestration.
//!
//! The `Scheduler` receives workload submissions, drives the placement
//! selector against registry snapshots, commits and releases ledger
//! resources, stages executables through the distributor seam, and holds
//! workloads no device currently fits in the scheduling queue.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── DeviceRegistry + ResourceLedger (snapshots, reserve/release)
//!   ├── fleetgrid-placement (rank, satisfiability)
//!   ├── SchedulingQueue (FIFO by submission, re-drained on events)
//!   ├── ExecutableDistributor (artifact staging, external transport)
//!   └── Dispatcher (execution start/cancel, external transport)
//! ```
//!
//! Queue re-drain triggers: any ledger release, a device coming online,
//! and a periodic fallback tick.

pub mod distributor;
pub mod error;
pub mod queue;
pub mod scheduler;

pub use distributor::{CachedDistributor, Dispatcher, ExecutableDistributor};
pub use error::{SchedulerError, SchedulerResult};
pub use queue::SchedulingQueue;
pub use scheduler::{ExecutionOutcome, Scheduler, SchedulerConfig, SubmitRequest};
