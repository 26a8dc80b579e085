//! Device communicator for collective operations.
//!
//! The MoE core only needs three collectives: an all-gather for the count
//! exchange, a variable-size all-to-all for token traffic, and an all-reduce
//! for job-wide telemetry. All of them are blocking and must be called by
//! every worker of the group in the same order, unless the group is aborted.

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

/// Trait for worker-to-worker communication.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: concatenate every rank's tensor along `gather_dim`, in rank order.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Variable-size all-to-all along dimension 0.
    ///
    /// # Arguments
    /// * `tensor` - Input tensor, size along dim 0 equals sum of `send_splits`
    /// * `send_splits` - Rows to send to each rank (length = world_size)
    /// * `recv_splits` - Rows to receive from each rank (length = world_size)
    ///
    /// The output holds the chunks received from ranks `0..world_size`
    /// concatenated in rank order, `sum(recv_splits)` rows in total.
    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor>;

    /// Abandon the current pass on every rank.
    ///
    /// Called by a worker that failed between collectives. Peers blocked in,
    /// or later entering, a collective of this group return
    /// [`DistributedError::Collective`]. A single worker has no peers, so the
    /// default does nothing.
    fn abort(&self, _reason: &str) {}
}

/// Check split vectors against the group size and the input tensor.
pub(crate) fn check_splits(
    tensor: &Tensor,
    send_splits: &[usize],
    recv_splits: &[usize],
    world_size: usize,
) -> Result<()> {
    for splits in [send_splits, recv_splits] {
        if splits.len() != world_size {
            return Err(DistributedError::SplitLength {
                actual: splits.len(),
                world_size,
            });
        }
    }
    let dims = tensor.dims();
    let total_send: usize = send_splits.iter().sum();
    if dims.first().copied() != Some(total_send) {
        let mut expected = dims.to_vec();
        if expected.is_empty() {
            expected.push(total_send);
        } else {
            expected[0] = total_send;
        }
        return Err(DistributedError::ShapeMismatch {
            expected,
            actual: dims.to_vec(),
        });
    }
    Ok(())
}

/// Communicator for single-worker execution.
///
/// All collectives are identity since there is only one rank.
pub struct LocalCommunicator {
    process_group: LocalProcessGroup,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self {
            process_group: LocalProcessGroup::new(),
        }
    }
}

impl Default for LocalCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _gather_dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        check_splits(tensor, send_splits, recv_splits, 1)?;
        if send_splits != recv_splits {
            return Err(DistributedError::ShapeMismatch {
                expected: send_splits.to_vec(),
                actual: recv_splits.to_vec(),
            });
        }
        Ok(tensor.clone())
    }
}
