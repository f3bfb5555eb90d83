//! Error taxonomy for the evolution core.
//!
//! Collisions, starvation and other episode endings are simulation outcomes,
//! not errors, and never show up here.

use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, SnakeError>;

#[derive(Debug, Error)]
pub enum SnakeError {
    /// Sensor width does not match the genome's first layer, or raw matrices
    /// do not fit the declared network shape.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// A persisted genome blob could not be decoded or migrated.
    #[error("genome deserialization failed: {0}")]
    Deserialization(String),

    /// Configuration or population state that must never be constructed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SnakeError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        SnakeError::InvariantViolation(msg.into())
    }
}
