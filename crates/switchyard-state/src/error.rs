//! Error types for the Switchyard state store.

use thiserror::Error;

use crate::types::{Revision, WeightsError};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("traffic revision conflict: expected {expected}, found {actual}")]
    RevisionConflict { expected: Revision, actual: Revision },

    #[error("invalid traffic weights: {0}")]
    InvalidWeights(#[from] WeightsError),
}

impl StateError {
    /// Storage-level failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Transaction(_) | StateError::Write(_) | StateError::Read(_)
        )
    }
}
