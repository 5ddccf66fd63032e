//! Error types for traffic switching, migration plans, and rollback.

use thiserror::Error;

use switchyard_core::EnvironmentId;
use switchyard_router::RouterError;
use switchyard_state::{PlanId, PlanStatus, PlanTransitionError, Revision, StateError, WeightsError};

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("invalid weights: {0}")]
    Validation(#[from] WeightsError),

    #[error("weights already match revision {revision}")]
    NoChange { revision: Revision },

    #[error("no traffic state has been initialized")]
    Uninitialized,

    #[error("traffic state changed underneath us (expected revision {expected}, found {actual})")]
    Conflict { expected: Revision, actual: Revision },

    #[error("state store error: {0}")]
    State(StateError),

    #[error("edge router reload failed: {0}")]
    Reload(#[source] RouterError),

    #[error("edge router did not adopt revision {revision} within {timeout_ms}ms")]
    NotAdopted { revision: Revision, timeout_ms: u64 },

    /// The switch failed and the prior weights were re-applied.
    #[error("{cause}; reverted to prior weights as revision {reverted_to}")]
    Reverted {
        cause: Box<SwitchError>,
        reverted_to: Revision,
    },

    #[error("{cause}; revert also failed: {revert}")]
    RevertFailed {
        cause: Box<SwitchError>,
        revert: String,
    },
}

impl SwitchError {
    /// Rejected before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(self, SwitchError::Validation(_) | SwitchError::NoChange { .. })
    }
}

impl From<StateError> for SwitchError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::InvalidWeights(w) => SwitchError::Validation(w),
            StateError::RevisionConflict { expected, actual } => {
                SwitchError::Conflict { expected, actual }
            }
            other => SwitchError::State(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid migration request: {0}")]
    Validation(String),

    /// Another plan holds the global plan lock.
    #[error("migration {holder} is already running")]
    Concurrency { holder: String },

    /// The target already receives all traffic. Not a failure.
    #[error("{0} already receives 100% of traffic")]
    AlreadyServing(EnvironmentId),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] PlanTransitionError),
}

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("plan {0} has no recorded baseline")]
    NoBaseline(PlanId),

    #[error("plan {id} is {status:?} and cannot be rolled back")]
    InvalidState { id: PlanId, status: PlanStatus },

    #[error("restoring baseline failed: {0}")]
    Switch(#[source] SwitchError),

    /// The environment traffic was restored to is itself unhealthy.
    #[error("restored environment {environment} is unhealthy (failing: {})", failing.join(", "))]
    RestoredUnhealthy {
        environment: EnvironmentId,
        failing: Vec<String>,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RollbackError {
    /// No automated remedy remains; an operator must step in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RollbackError::Switch(_) | RollbackError::RestoredUnhealthy { .. }
        )
    }
}
