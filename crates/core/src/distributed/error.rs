//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Tensor shape mismatch between ranks participating in a collective.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The collective itself failed (transport error, poisoned group state).
    #[error("collective {op} failed: {reason}")]
    CollectiveFailed { op: &'static str, reason: String },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
