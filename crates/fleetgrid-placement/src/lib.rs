//! fleetgrid-placement — picks the compute device for a workload.
//!
//! Given a point-in-time snapshot of the fleet, the selector:
//! 1. Filters to online devices that satisfy the workload's affinity and
//!    whose free resources cover the request in every dimension
//! 2. Ranks the qualifying devices by normalized headroom — the minimum
//!    free/total ratio across dimensions after the reservation, so no
//!    single resource type gets starved
//! 3. Breaks ties by lowest device id for reproducible decisions
//!
//! "No device qualifies" is not an error; it is the normal trigger for
//! queueing. A separate check distinguishes requests no device's *total*
//! capacity could ever satisfy.

pub mod convert;
pub mod selector;

pub use convert::build_candidates;
pub use selector::{CandidateDevice, DeviceScore, qualifies, rank, satisfiable, select};
