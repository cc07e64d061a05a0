//! Errors surfaced by instance managers and the agent.

use fleet_events::InstanceStatus;
use fleet_id::InstanceId;
use thiserror::Error;

use crate::instance::StateError;

/// Errors returned from lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The instance is in a status that does not allow the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Destroy without `force` on an instance with a live workload.
    #[error("instance is running")]
    InstanceIsRunning,

    /// No manager is registered for the ID.
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// The caller's deadline passed before the instance exited.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Preparation failed for good and the instance was destroyed.
    #[error("preparation abandoned: {reason}")]
    PreparationAbandoned { reason: String },

    /// Persisting an event failed; the transition did not happen.
    #[error("state error: {0}")]
    State(StateError),

    /// The workload runtime reported an error.
    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl LifecycleError {
    pub(crate) fn precondition(op: &str, status: InstanceStatus) -> Self {
        Self::FailedPrecondition(format!("cannot {op} instance in status {status}"))
    }

    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition(_))
    }
}

impl From<StateError> for LifecycleError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::InvalidTransition { from, to } => Self::FailedPrecondition(format!(
                "cannot transition instance from {from} to {to}"
            )),
            other => Self::State(other),
        }
    }
}
