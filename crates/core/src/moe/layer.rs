//! Expert-parallel MoE layer.
//!
//! Each worker stores `num_expert` experts out of `num_expert * world_size`.
//!
//! ```text
//! 1. Gate: every worker routes its own tokens
//! 2. Dispatch: counts are exchanged, then tokens move to the expert owners
//! 3. Local compute: each local expert runs once over its contiguous batch
//! 4. Combine: outputs return to their source worker and are summed per token
//! ```

use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use super::context::PassContext;
use super::error::{MoEError, Result};
use super::expert::{ExpertCompute, MlpExperts};
use super::expert_map::ExpertMap;
use super::fusion::FusionPolicy;
use super::gate::{Gate, NaiveGate, Routing};
use super::record::CommRecord;
use super::token_dispatch::TokenDispatcher;
use crate::config::MoEConfig;
use crate::distributed::DeviceCommunicator;

/// Result of one MoE forward pass on one worker.
#[derive(Debug)]
pub struct MoEOutput {
    /// Shape: [num_tokens, d_model]
    pub output: Tensor,
    pub record: CommRecord,
    /// Rows each local expert computed in this pass.
    pub fwd_expert_count: Vec<usize>,
}

pub struct MoELayer {
    config: MoEConfig,
    gate: Box<dyn Gate>,
    experts: Box<dyn ExpertCompute>,
    dispatcher: TokenDispatcher,
}

impl MoELayer {
    /// Create a layer with a [`NaiveGate`] and [`MlpExperts`].
    ///
    /// # Arguments
    /// * `config` - Layer configuration; `world_size` must match the communicator
    /// * `vb` - Variable builder; parameters live under `gate` and `experts`
    /// * `comm` - Communicator of the MoE group
    pub fn new(config: MoEConfig, vb: VarBuilder, comm: Arc<dyn DeviceCommunicator>) -> Result<Self> {
        config.validate()?;
        let gate = NaiveGate::new(
            config.d_model,
            config.total_experts(),
            config.top_k,
            vb.pp("gate"),
        )?;
        let experts = MlpExperts::new(
            config.num_expert,
            config.d_model,
            config.d_hidden,
            config.activation,
            vb.pp("experts"),
        )?;
        Self::from_parts(config, Box::new(gate), Box::new(experts), comm)
    }

    /// Assemble a layer from a custom gate and expert executor.
    pub fn from_parts(
        config: MoEConfig,
        gate: Box<dyn Gate>,
        experts: Box<dyn ExpertCompute>,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        config.validate()?;

        let group = comm.process_group();
        if group.world_size() != config.world_size {
            return Err(MoEError::InvalidConfig(format!(
                "world_size {} does not match communicator size {}",
                config.world_size,
                group.world_size()
            )));
        }
        if experts.num_expert() != config.num_expert {
            return Err(MoEError::InvalidConfig(format!(
                "expert executor holds {} experts, expected {}",
                experts.num_expert(),
                config.num_expert
            )));
        }
        if gate.total_experts() != config.total_experts() || gate.top_k() != config.top_k {
            return Err(MoEError::InvalidConfig(format!(
                "gate routes top-{} over {} experts, expected top-{} over {}",
                gate.top_k(),
                gate.total_experts(),
                config.top_k,
                config.total_experts()
            )));
        }

        let expert_map = ExpertMap::new(
            config.num_expert,
            config.world_size,
            group.rank(),
            config.placement,
        );
        let dispatcher = TokenDispatcher::new(
            expert_map,
            comm,
            config.top_k,
            FusionPolicy::new(config.fusion),
        );

        Ok(Self {
            config,
            gate,
            experts,
            dispatcher,
        })
    }

    /// Route `hidden_states` with the gate, then dispatch, compute and combine.
    ///
    /// Collective: every worker of the group must call this once per pass.
    /// An error on any worker aborts the group, so the pass fails everywhere.
    pub fn forward(&self, hidden_states: &Tensor, ctx: &PassContext) -> Result<MoEOutput> {
        let result = self
            .check_width(hidden_states)
            .and_then(|_| self.gate.route(hidden_states))
            .and_then(|routing| self.run_pass(hidden_states, &routing, ctx));
        self.abort_on_error(result)
    }

    /// Run the pass with a routing decision supplied by the caller.
    pub fn forward_with_routing(
        &self,
        hidden_states: &Tensor,
        routing: &Routing,
        ctx: &PassContext,
    ) -> Result<MoEOutput> {
        let result = self.run_pass(hidden_states, routing, ctx);
        self.abort_on_error(result)
    }

    fn abort_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.dispatcher.abort(err);
        }
        result
    }

    fn run_pass(
        &self,
        hidden_states: &Tensor,
        routing: &Routing,
        ctx: &PassContext,
    ) -> Result<MoEOutput> {
        let num_tokens = self.check_width(hidden_states)?;
        let keep = padding_keep(ctx.batch_padding_mask.as_ref(), num_tokens)?;

        let mut record = CommRecord::new();
        let dispatched = self.dispatcher.dispatch(
            hidden_states,
            &routing.expert_ids,
            keep.as_deref(),
            ctx.fuse_token,
            &mut record,
        )?;

        let expert_output = self
            .experts
            .compute(&dispatched.expert_inputs, dispatched.fwd_expert_count())?;

        let output = self.dispatcher.combine(
            &expert_output,
            &dispatched,
            routing.weights.as_ref(),
            &mut record,
        )?;

        tracing::debug!(
            layer = ctx.layer_idx,
            rank = self.expert_map().rank(),
            num_tokens,
            fwd_expert_count = ?dispatched.fwd_expert_count(),
            fused = record.fused,
            traffic_size = record.traffic_size(),
            "moe forward"
        );

        Ok(MoEOutput {
            output,
            record,
            fwd_expert_count: dispatched.fwd_expert_count().to_vec(),
        })
    }

    fn check_width(&self, hidden_states: &Tensor) -> Result<usize> {
        let dims = hidden_states.dims();
        let width = dims.last().copied().unwrap_or(0);
        if dims.len() != 2 || width != self.config.d_model {
            return Err(MoEError::ShapeMismatch {
                expected: self.config.d_model,
                actual: width,
            });
        }
        Ok(dims[0])
    }

    pub fn config(&self) -> &MoEConfig {
        &self.config
    }

    pub fn expert_map(&self) -> &ExpertMap {
        self.dispatcher.expert_map()
    }

    pub fn gate(&self) -> &dyn Gate {
        self.gate.as_ref()
    }

    pub fn experts(&self) -> &dyn ExpertCompute {
        self.experts.as_ref()
    }
}

/// Per-token keep flags from a padding mask (zero = padding).
fn padding_keep(mask: Option<&Tensor>, num_tokens: usize) -> Result<Option<Vec<bool>>> {
    let Some(mask) = mask else {
        return Ok(None);
    };
    let values: Vec<f32> = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    if values.len() != num_tokens {
        return Err(MoEError::MaskLength {
            expected: num_tokens,
            actual: values.len(),
        });
    }
    Ok(Some(values.into_iter().map(|v| v != 0.0).collect()))
}
