//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
///
/// "No device qualifies" is deliberately not here: queueing is a state,
/// not an error. Terminal workload outcomes are carried by
/// `WorkloadState::Failed` with a `FailureReason`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("workload already submitted: {0}")]
    DuplicateWorkload(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
