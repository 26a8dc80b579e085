//! Error types for collective operations.

use thiserror::Error;

/// Errors raised by the collective-communication layer.
///
/// None of these are retried: a collective that fails on one worker leaves
/// the others blocked, so the whole pass is aborted.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Split vector length does not match the group size.
    #[error("split length {actual} does not match world_size {world_size}")]
    SplitLength { actual: usize, world_size: usize },

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer worker left the collective in an unusable state.
    #[error("collective {op} failed: {reason}")]
    Collective { op: &'static str, reason: String },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
