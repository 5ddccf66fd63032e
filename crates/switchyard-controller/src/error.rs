//! Controller error taxonomy: the only errors that cross the operator boundary.

use serde::Serialize;
use thiserror::Error;

use switchyard_rollout::{PlanError, RollbackError, SwitchError};
use switchyard_state::{Revision, StateError};

pub type ControllerResult<T> = Result<T, ControllerError>;

/// What happened to traffic after an operational failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackOutcome {
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RollbackOutcome {
    pub fn restored(revision: Option<Revision>) -> Self {
        Self {
            restored: true,
            revision,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            restored: false,
            revision: None,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Malformed request; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another migration or switch holds the plan lock.
    #[error("operation rejected: {0}")]
    Concurrency(String),

    /// A health gate or switch verification failed; traffic was handled
    /// as described by `rollback`.
    #[error("operation failed: {reason}")]
    Operational {
        reason: String,
        rollback: Option<RollbackOutcome>,
    },

    /// No automated remedy remains. A Critical alert has been raised.
    #[error("manual intervention required: {0}")]
    Fatal(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ControllerError {
    pub fn operational(reason: impl Into<String>) -> Self {
        ControllerError::Operational {
            reason: reason.into(),
            rollback: None,
        }
    }

    /// Short machine-readable class name.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Validation(_) => "validation",
            ControllerError::NotFound(_) => "not_found",
            ControllerError::Concurrency(_) => "concurrency",
            ControllerError::Operational { .. } => "operational",
            ControllerError::Fatal(_) => "fatal",
            ControllerError::State(_) => "internal",
        }
    }
}

impl From<PlanError> for ControllerError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::Validation(msg) => ControllerError::Validation(msg),
            PlanError::Concurrency { .. } => ControllerError::Concurrency(e.to_string()),
            PlanError::AlreadyServing(_) => ControllerError::Validation(e.to_string()),
            PlanError::State(s) => ControllerError::State(s),
            PlanError::Transition(t) => ControllerError::Fatal(t.to_string()),
        }
    }
}

impl From<SwitchError> for ControllerError {
    fn from(e: SwitchError) -> Self {
        let message = e.to_string();
        if e.is_validation() {
            return ControllerError::Validation(message);
        }
        match e {
            SwitchError::Uninitialized => ControllerError::Validation(message),
            SwitchError::Conflict { .. } => ControllerError::Concurrency(message),
            SwitchError::State(s) => ControllerError::State(s),
            SwitchError::Reverted { reverted_to, .. } => ControllerError::Operational {
                reason: message,
                rollback: Some(RollbackOutcome::restored(Some(reverted_to))),
            },
            SwitchError::RevertFailed { .. } => ControllerError::Fatal(message),
            _ => ControllerError::operational(message),
        }
    }
}

impl From<RollbackError> for ControllerError {
    fn from(e: RollbackError) -> Self {
        if e.is_fatal() {
            return ControllerError::Fatal(e.to_string());
        }
        match e {
            RollbackError::State(s) => ControllerError::State(s),
            other => ControllerError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::EnvironmentId;
    use switchyard_state::WeightsError;

    #[test]
    fn switch_errors_map_onto_the_taxonomy() {
        let e: ControllerError = SwitchError::Validation(WeightsError::BadSum(120)).into();
        assert_eq!(e.kind(), "validation");

        let e: ControllerError = SwitchError::Reverted {
            cause: Box::new(SwitchError::NotAdopted {
                revision: 4,
                timeout_ms: 100,
            }),
            reverted_to: 5,
        }
        .into();
        match e {
            ControllerError::Operational { rollback, .. } => {
                assert_eq!(rollback, Some(RollbackOutcome::restored(Some(5))));
            }
            other => panic!("unexpected {other:?}"),
        }

        let e: ControllerError = SwitchError::RevertFailed {
            cause: Box::new(SwitchError::Uninitialized),
            revert: "router gone".to_string(),
        }
        .into();
        assert_eq!(e.kind(), "fatal");
    }

    #[test]
    fn restored_unhealthy_is_fatal() {
        let e: ControllerError = RollbackError::RestoredUnhealthy {
            environment: EnvironmentId::Primary,
            failing: vec!["deep@10.0.0.1:80".to_string()],
        }
        .into();
        assert!(matches!(e, ControllerError::Fatal(ref m) if m.contains("deep@10.0.0.1:80")));
    }

    #[test]
    fn concurrency_keeps_the_holder() {
        let e: ControllerError = PlanError::Concurrency {
            holder: "abc".to_string(),
        }
        .into();
        assert!(matches!(e, ControllerError::Concurrency(ref m) if m.contains("abc")));
    }
}
