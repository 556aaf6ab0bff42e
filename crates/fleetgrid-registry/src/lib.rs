//! fleetgrid-registry — device membership and resource accounting.
//!
//! Tracks the live fleet and answers "how much is free":
//!
//! - `ResourceLedger` keeps per-device total vs. committed resources with
//!   per-device linearization (no global lock; throughput scales with the
//!   number of devices)
//! - `DeviceRegistry` consumes device-origin heartbeats, detects heartbeat
//!   loss, and broadcasts liveness events that the scheduler uses as
//!   queue re-drain triggers
//! - `CapabilityHub` fans out full-replacement I/O capability lists to
//!   subscribers

pub mod capabilities;
pub mod ledger;
pub mod registry;

pub use capabilities::CapabilityHub;
pub use ledger::{LedgerEntry, ResourceLedger};
pub use registry::{DeviceHeartbeat, DeviceRegistry, RegistryEvent};
