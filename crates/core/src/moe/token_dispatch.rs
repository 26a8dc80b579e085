//! Token scatter and gather across workers.
//!
//! ## Communication Pattern
//!
//! ```text
//! Input [num_tokens, d_model], expert ids [num_tokens, top_k]
//!     ↓
//! dispatch():
//!     1. Count assignments per global expert
//!     2. all_gather the count vectors (every worker sees the full matrix)
//!     3. Stable-sort rows into [dest rank][local expert] buckets
//!     4. all_to_all_v the buckets (one fused round, or one round per local slot)
//!     5. Reorder received rows to [local expert][src rank]
//!     ↓
//! Expert computation on contiguous per-expert batches
//!     ↓
//! combine():
//!     1. Reverse the reorder and the exchange
//!     2. Weight each row by its gate score and sum over top_k into its token
//!     ↓
//! Output [num_tokens, d_model]
//! ```

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use super::counter::{count_local, exchange_counts};
use super::error::{MoEError, Result};
use super::expert_map::ExpertMap;
use super::fusion::{FusionDecision, FusionPolicy};
use super::plan::DispatchPlan;
use super::record::CommRecord;
use crate::distributed::DeviceCommunicator;

/// State produced by [`TokenDispatcher::dispatch`] and consumed by
/// [`TokenDispatcher::combine`].
#[derive(Debug)]
pub struct Dispatched {
    /// Rows for the local experts, expert-major.
    /// Shape: [sum(fwd_expert_count), d_model]
    pub expert_inputs: Tensor,

    /// Plan shared by scatter and gather.
    pub plan: DispatchPlan,

    /// Fusion decision applied to both directions.
    pub decision: FusionDecision,

    hidden_size: usize,
    dtype: DType,
    device: Device,
}

impl Dispatched {
    /// Rows each local expert has to compute.
    pub fn fwd_expert_count(&self) -> &[usize] {
        self.plan.fwd_expert_count()
    }
}

/// Moves token rows between their source worker and the workers hosting
/// their experts.
pub struct TokenDispatcher {
    expert_map: ExpertMap,
    comm: Arc<dyn DeviceCommunicator>,
    top_k: usize,
    policy: FusionPolicy,
}

impl TokenDispatcher {
    /// Create a new token dispatcher.
    ///
    /// # Arguments
    /// * `expert_map` - Expert placement as seen by this worker
    /// * `comm` - Communicator of the MoE group
    /// * `top_k` - Number of experts per token
    /// * `policy` - Fusion policy for the token exchanges
    pub fn new(
        expert_map: ExpertMap,
        comm: Arc<dyn DeviceCommunicator>,
        top_k: usize,
        policy: FusionPolicy,
    ) -> Self {
        Self {
            expert_map,
            comm,
            top_k,
            policy,
        }
    }

    /// Scatter tokens to the workers owning their experts.
    ///
    /// # Arguments
    /// * `hidden_states` - Token rows of shape `[num_tokens, d_model]`
    /// * `expert_indices` - Global expert ids of shape `[num_tokens, top_k]`
    /// * `keep` - Optional per-token flag; `false` tokens are not dispatched
    /// * `fuse_token` - Allow the fusion policy to merge transfers
    /// * `record` - Communication record of the current pass
    pub fn dispatch(
        &self,
        hidden_states: &Tensor,
        expert_indices: &Tensor,
        keep: Option<&[bool]>,
        fuse_token: bool,
        record: &mut CommRecord,
    ) -> Result<Dispatched> {
        let (num_tokens, hidden_size) = hidden_states.dims2()?;
        let device = hidden_states.device();
        let dtype = hidden_states.dtype();

        self.check_routing_shape(expert_indices, num_tokens)?;
        let ids: Vec<u32> = expert_indices
            .flatten_all()?
            .to_dtype(DType::U32)?
            .to_vec1()?;

        if let Some(keep) = keep {
            if keep.len() != num_tokens {
                return Err(MoEError::MaskLength {
                    expected: num_tokens,
                    actual: keep.len(),
                });
            }
        }

        let local = count_local(&ids, keep, self.top_k, self.expert_map.total_experts())?;
        let start = Instant::now();
        let matrix = exchange_counts(&local, self.comm.as_ref(), device)?;
        if !self.is_single() {
            record.add_collective(start.elapsed());
        }

        let plan = DispatchPlan::build(&self.expert_map, &ids, keep, self.top_k, &local, matrix)?;
        plan.validate()?;

        let bytes_per_row = hidden_size * dtype.size_in_bytes();
        let decision = self
            .policy
            .decide(plan.matrix(), &self.expert_map, bytes_per_row, fuse_token);
        record.apply_decision(&decision);

        let send_buffer = select_rows(hidden_states, &plan.token_indices())?;
        let expert_inputs = if self.is_single() {
            // One worker: the send buffer is already expert-major.
            send_buffer
        } else if decision.fused {
            self.scatter_fused(&send_buffer, &plan, record)?
        } else {
            self.scatter_per_slot(&send_buffer, &plan, record)?
        };
        record.scatter_bytes += (plan.remote_send_rows() * bytes_per_row) as u64;

        let received = expert_inputs.dim(0)?;
        if received != plan.total_recv() {
            return Err(MoEError::CountSumMismatch {
                expected: plan.total_recv(),
                actual: received,
            });
        }

        tracing::debug!(
            rank = self.expert_map.rank(),
            num_tokens,
            sent = plan.total_send(),
            received,
            fused = decision.fused,
            "tokens dispatched"
        );

        Ok(Dispatched {
            expert_inputs,
            plan,
            decision,
            hidden_size,
            dtype,
            device: device.clone(),
        })
    }

    /// Gather expert outputs back to their tokens.
    ///
    /// # Arguments
    /// * `expert_output` - Expert outputs, same layout as `dispatched.expert_inputs`
    /// * `dispatched` - Result of the matching [`Self::dispatch`] call
    /// * `routing_weights` - Optional gate scores `[num_tokens, top_k]`; plain sum when `None`
    /// * `record` - Communication record of the current pass
    ///
    /// # Returns
    /// Combined output of shape `[num_tokens, d_model]`; dropped tokens are zero.
    pub fn combine(
        &self,
        expert_output: &Tensor,
        dispatched: &Dispatched,
        routing_weights: Option<&Tensor>,
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let plan = &dispatched.plan;
        let (rows, cols) = expert_output.dims2()?;
        if cols != dispatched.hidden_size {
            return Err(MoEError::ShapeMismatch {
                expected: dispatched.hidden_size,
                actual: cols,
            });
        }
        if rows != plan.total_recv() {
            return Err(MoEError::CountSumMismatch {
                expected: plan.total_recv(),
                actual: rows,
            });
        }
        if let Some(weights) = routing_weights {
            self.check_routing_shape(weights, plan.num_tokens())?;
        }

        let returned = if self.is_single() {
            expert_output.clone()
        } else if dispatched.decision.fused {
            self.gather_fused(expert_output, plan, record)?
        } else {
            self.gather_per_slot(expert_output, plan, record)?
        };
        let bytes_per_row = cols * expert_output.dtype().size_in_bytes();
        record.gather_bytes += (plan.remote_recv_rows() * bytes_per_row) as u64;

        let returned_rows = returned.dim(0)?;
        if returned_rows != plan.total_send() {
            return Err(MoEError::CountSumMismatch {
                expected: plan.total_send(),
                actual: returned_rows,
            });
        }

        self.scatter_add_weighted(&returned, dispatched, routing_weights)
    }

    /// One all_to_all_v for the whole pass.
    fn scatter_fused(
        &self,
        send_buffer: &Tensor,
        plan: &DispatchPlan,
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let recv = self.exchange(send_buffer, &plan.send_splits(), &plan.recv_splits(), record)?;
        let received = recv.dim(0)?;
        if received != plan.total_recv() {
            self.check_slot_rows(plan.fwd_expert_count(), &plan.recv_rows_per_slot(received))?;
            return Err(MoEError::CountSumMismatch {
                expected: plan.total_recv(),
                actual: received,
            });
        }
        select_rows(&recv, &plan.recv_to_expert_major())
    }

    /// One all_to_all_v per local expert slot; results arrive expert-major.
    fn scatter_per_slot(
        &self,
        send_buffer: &Tensor,
        plan: &DispatchPlan,
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let slot_major = select_rows(send_buffer, &plan.send_to_slot_major())?;
        let mut offset = 0;
        let mut pieces = Vec::with_capacity(plan.num_expert());

        for slot in 0..plan.num_expert() {
            let send_splits = plan.slot_send_splits(slot);
            let rows: usize = send_splits.iter().sum();
            let chunk = slot_major.narrow(0, offset, rows)?;
            offset += rows;

            let recv = self.exchange(&chunk, &send_splits, &plan.slot_recv_splits(slot), record)?;
            let declared = plan.fwd_expert_count()[slot];
            let received = recv.dim(0)?;
            if received != declared {
                return Err(MoEError::CountMismatch {
                    expert: self.expert_map.to_global(slot),
                    declared,
                    received,
                });
            }
            if received > 0 {
                pieces.push(recv);
            }
        }
        concat_rows(pieces, send_buffer)
    }

    fn gather_fused(
        &self,
        expert_output: &Tensor,
        plan: &DispatchPlan,
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let recv_major = select_rows(expert_output, &plan.expert_major_to_recv())?;
        let back = self.exchange(&recv_major, &plan.recv_splits(), &plan.send_splits(), record)?;
        let returned = back.dim(0)?;
        if returned != plan.total_send() {
            self.check_slot_rows(&plan.send_per_slot(), &plan.send_rows_per_slot(returned))?;
        }
        Ok(back)
    }

    fn gather_per_slot(
        &self,
        expert_output: &Tensor,
        plan: &DispatchPlan,
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let mut offset = 0;
        let mut pieces = Vec::with_capacity(plan.num_expert());

        for (slot, &count) in plan.fwd_expert_count().iter().enumerate() {
            let chunk = expert_output.narrow(0, offset, count)?;
            offset += count;

            let send_splits = plan.slot_send_splits(slot);
            let back = self.exchange(&chunk, &plan.slot_recv_splits(slot), &send_splits, record)?;
            let expected: usize = send_splits.iter().sum();
            let received = back.dim(0)?;
            if received != expected {
                return Err(MoEError::CountMismatch {
                    expert: self.expert_map.to_global(slot),
                    declared: expected,
                    received,
                });
            }
            if received > 0 {
                pieces.push(back);
            }
        }
        let slot_major = concat_rows(pieces, expert_output)?;
        select_rows(&slot_major, &plan.slot_major_to_send())
    }

    /// First local slot whose received rows differ from its declared count.
    fn check_slot_rows(&self, declared: &[usize], received: &[usize]) -> Result<()> {
        for (slot, (&declared, &received)) in declared.iter().zip(received).enumerate() {
            if declared != received {
                return Err(MoEError::CountMismatch {
                    expert: self.expert_map.to_global(slot),
                    declared,
                    received,
                });
            }
        }
        Ok(())
    }

    /// Routing tensors must be `[num_tokens, top_k]`.
    fn check_routing_shape(&self, tensor: &Tensor, num_tokens: usize) -> Result<()> {
        let expected = [num_tokens, self.top_k];
        if tensor.dims() != expected {
            return Err(MoEError::RoutingShape {
                expected: expected.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(())
    }

    fn exchange(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
        record: &mut CommRecord,
    ) -> Result<Tensor> {
        let start = Instant::now();
        let out = self.comm.all_to_all_v(tensor, send_splits, recv_splits)?;
        let elapsed = start.elapsed();
        record.add_collective(elapsed);
        tracing::trace!(
            rank = self.expert_map.rank(),
            ?send_splits,
            ?recv_splits,
            elapsed_us = elapsed.as_micros() as u64,
            "all_to_all_v"
        );
        Ok(out)
    }

    /// Weighted scatter-add of returned rows into their tokens.
    fn scatter_add_weighted(
        &self,
        returned: &Tensor,
        dispatched: &Dispatched,
        routing_weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let plan = &dispatched.plan;
        let output = Tensor::zeros(
            (plan.num_tokens(), dispatched.hidden_size),
            dispatched.dtype,
            &dispatched.device,
        )?;
        let total = plan.total_send();
        if total == 0 {
            return Ok(output);
        }

        let contributions = match routing_weights {
            Some(weights) => {
                let flat: Vec<f32> = weights.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
                let per_row: Vec<f32> = plan.pos().iter().map(|&p| flat[p]).collect();
                let per_row = Tensor::from_vec(per_row, (total, 1), &dispatched.device)?
                    .to_dtype(returned.dtype())?;
                returned.broadcast_mul(&per_row)?
            }
            None => returned.clone(),
        };

        let indices = Tensor::from_vec(plan.token_indices(), total, &dispatched.device)?;
        Ok(output.index_add(&indices, &contributions, 0)?)
    }

    /// Abort the group so peers blocked in this pass fail instead of waiting.
    pub fn abort(&self, err: &MoEError) {
        tracing::warn!(rank = self.expert_map.rank(), error = %err, "aborting pass");
        self.comm.abort(&err.to_string());
    }

    fn is_single(&self) -> bool {
        self.expert_map.world_size() == 1
    }

    /// Get the expert map.
    pub fn expert_map(&self) -> &ExpertMap {
        &self.expert_map
    }

    /// Get the top-k value.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn policy(&self) -> &FusionPolicy {
        &self.policy
    }
}

/// Gather rows by index; an empty index yields a `[0, cols]` tensor.
fn select_rows(tensor: &Tensor, indices: &[u32]) -> Result<Tensor> {
    if indices.is_empty() {
        let (_, cols) = tensor.dims2()?;
        return Ok(Tensor::zeros((0, cols), tensor.dtype(), tensor.device())?);
    }
    let index = Tensor::from_vec(indices.to_vec(), indices.len(), tensor.device())?;
    Ok(tensor.index_select(&index, 0)?)
}

/// Concatenate row blocks; `like` supplies width, dtype and device when empty.
fn concat_rows(pieces: Vec<Tensor>, like: &Tensor) -> Result<Tensor> {
    if pieces.is_empty() {
        let (_, cols) = like.dims2()?;
        return Ok(Tensor::zeros((0, cols), like.dtype(), like.device())?);
    }
    Ok(Tensor::cat(&pieces, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;

    fn single_worker_dispatcher(num_expert: usize, top_k: usize) -> TokenDispatcher {
        TokenDispatcher::new(
            ExpertMap::single_worker(num_expert),
            Arc::new(LocalCommunicator::new()),
            top_k,
            FusionPolicy::default(),
        )
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_dispatch_single_worker_groups_by_expert() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 1);
        let hidden_states =
            Tensor::from_vec(vec![1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0], (3, 2), &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![1u32, 0, 1], (3, 1), &device).unwrap();

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap();

        assert_eq!(dispatched.fwd_expert_count(), &[1, 2]);
        assert_eq!(
            to_vec(&dispatched.expert_inputs),
            vec![2.0, 2.0, 1.0, 1.0, 3.0, 3.0]
        );
        assert_eq!(record.traffic_size(), 0);
        assert_eq!(record.collectives, 0);
    }

    #[test]
    fn test_combine_restores_order() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 2);

        let hidden_states =
            Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![0u32, 1, 1, 0], (2, 2), &device).unwrap();
        let routing_weights =
            Tensor::from_vec(vec![0.5f32, 0.5, 0.6, 0.4], (2, 2), &device).unwrap();

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap();

        // Identity experts
        let expert_output = dispatched.expert_inputs.clone();
        let output = dispatcher
            .combine(&expert_output, &dispatched, Some(&routing_weights), &mut record)
            .unwrap();

        // Token 0: 0.5 * [1,2] + 0.5 * [1,2] = [1,2]
        // Token 1: 0.6 * [3,4] + 0.4 * [3,4] = [3,4]
        let out = to_vec(&output);
        for (got, want) in out.iter().zip([1.0f32, 2.0, 3.0, 4.0]) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_combine_without_weights_sums_top_k() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(4, 2);
        let hidden_states = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![3u32, 0], (1, 2), &device).unwrap();

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap();
        let output = dispatcher
            .combine(&dispatched.expert_inputs, &dispatched, None, &mut record)
            .unwrap();
        assert_eq!(to_vec(&output), vec![2.0, 4.0]);
    }

    #[test]
    fn test_empty_tokens() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 1);
        let hidden_states = Tensor::zeros((0, 4), DType::F32, &device).unwrap();
        let expert_indices = Tensor::zeros((0, 1), DType::U32, &device).unwrap();

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap();
        assert_eq!(dispatched.expert_inputs.dims(), &[0, 4]);
        assert_eq!(dispatched.fwd_expert_count(), &[0, 0]);

        let output = dispatcher
            .combine(&dispatched.expert_inputs, &dispatched, None, &mut record)
            .unwrap();
        assert_eq!(output.dims(), &[0, 4]);
    }

    #[test]
    fn test_dropped_tokens_produce_zero_rows() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 1);
        let hidden_states =
            Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![0u32, 1], (2, 1), &device).unwrap();
        let keep = [true, false];

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, Some(&keep), false, &mut record)
            .unwrap();
        assert_eq!(dispatched.fwd_expert_count(), &[1, 0]);

        let output = dispatcher
            .combine(&dispatched.expert_inputs, &dispatched, None, &mut record)
            .unwrap();
        assert_eq!(to_vec(&output), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_out_of_range_expert_is_rejected() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 1);
        let hidden_states = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![7u32], (1, 1), &device).unwrap();

        let mut record = CommRecord::new();
        let err = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap_err();
        assert!(matches!(err, MoEError::ExpertOutOfRange { expert: 7, .. }));
    }

    #[test]
    fn test_combine_rejects_wrong_row_count() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(2, 1);
        let hidden_states = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let expert_indices = Tensor::from_vec(vec![0u32, 1, 1], (3, 1), &device).unwrap();

        let mut record = CommRecord::new();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &expert_indices, None, false, &mut record)
            .unwrap();
        let short = dispatched.expert_inputs.narrow(0, 0, 2).unwrap();
        let err = dispatcher
            .combine(&short, &dispatched, None, &mut record)
            .unwrap_err();
        assert!(matches!(
            err,
            MoEError::CountSumMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_routing_shape_is_checked() {
        let device = Device::Cpu;
        let dispatcher = single_worker_dispatcher(4, 2);
        let hidden_states = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let mut record = CommRecord::new();

        // right element count, wrong layout
        let flat_ids = Tensor::from_vec(vec![0u32, 1, 2, 3], 4, &device).unwrap();
        let err = dispatcher
            .dispatch(&hidden_states, &flat_ids, None, false, &mut record)
            .unwrap_err();
        assert!(matches!(err, MoEError::RoutingShape { .. }));

        let ids = Tensor::from_vec(vec![0u32, 1, 2, 3], (2, 2), &device).unwrap();
        let dispatched = dispatcher
            .dispatch(&hidden_states, &ids, None, false, &mut record)
            .unwrap();
        let weights = Tensor::full(0.5f32, (2, 3), &device).unwrap();
        let err = dispatcher
            .combine(&dispatched.expert_inputs, &dispatched, Some(&weights), &mut record)
            .unwrap_err();
        match err {
            MoEError::RoutingShape { expected, actual } => {
                assert_eq!(expected, vec![2, 2]);
                assert_eq!(actual, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_accessors() {
        let dispatcher = single_worker_dispatcher(8, 2);
        assert_eq!(dispatcher.top_k(), 2);
        assert_eq!(dispatcher.expert_map().total_experts(), 8);
        assert!(!dispatcher.policy().config().force);
    }
}
