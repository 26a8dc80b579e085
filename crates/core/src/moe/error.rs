use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors surfaced by a MoE forward pass.
///
/// Every variant aborts the current pass. Count mismatches are protocol bugs,
/// not transient conditions, so nothing here is ever retried.
#[derive(Error, Debug)]
pub enum MoEError {
    /// Input feature width does not match `d_model`.
    #[error("input feature width {actual} does not match d_model {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Rows received for an expert differ from its declared count.
    #[error("expert {expert}: declared {declared} tokens, received {received}")]
    CountMismatch {
        expert: usize,
        declared: usize,
        received: usize,
    },

    /// The count array does not account for every assignment.
    #[error("expert counts sum to {actual}, expected {expected} assignments")]
    CountSumMismatch { expected: usize, actual: usize },

    /// An assignment points at an expert that does not exist.
    #[error("expert id {expert} out of range: total_experts = {total_experts}")]
    ExpertOutOfRange { expert: usize, total_experts: usize },

    /// Expert ids or gate weights are not shaped `[num_tokens, top_k]`.
    #[error("routing tensor shape {actual:?} does not match {expected:?}")]
    RoutingShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Padding mask length differs from the number of tokens.
    #[error("padding mask has {actual} entries, expected {expected} tokens")]
    MaskLength { expected: usize, actual: usize },

    /// Construction parameters are unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A collective failed.
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    /// Underlying tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoEError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_shape_mismatch() {
        let e = MoEError::ShapeMismatch {
            expected: 1024,
            actual: 512,
        };
        assert_eq!(
            e.to_string(),
            "input feature width 512 does not match d_model 1024"
        );
    }

    #[test]
    fn test_error_display_count_mismatch() {
        let e = MoEError::CountMismatch {
            expert: 3,
            declared: 5,
            received: 4,
        };
        assert_eq!(e.to_string(), "expert 3: declared 5 tokens, received 4");
    }

    #[test]
    fn test_distributed_error_converts() {
        let e: MoEError = DistributedError::SplitLength {
            actual: 1,
            world_size: 2,
        }
        .into();
        assert!(matches!(e, MoEError::Distributed(_)));
    }
}
