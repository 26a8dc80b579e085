//! Gating: which experts each token visits, and with which weights.
//!
//! The dispatcher only needs the `[num_tokens, top_k]` expert ids; the
//! weights are applied by the combiner. A gate that returns no weights makes
//! the combiner sum the `top_k` expert outputs unweighted.

use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use super::error::{MoEError, Result};

/// Routing decision for one batch.
#[derive(Debug, Clone)]
pub struct Routing {
    /// Global expert ids, shape `[num_tokens, top_k]`, dtype u32.
    pub expert_ids: Tensor,
    /// Combine weights, shape `[num_tokens, top_k]`.
    pub weights: Option<Tensor>,
}

impl Routing {
    pub fn new(expert_ids: Tensor, weights: Option<Tensor>) -> Self {
        Self {
            expert_ids,
            weights,
        }
    }
}

/// Trait for MoE gates.
pub trait Gate: Send + Sync {
    /// Route tokens to experts.
    ///
    /// # Arguments
    /// * `hidden_states` - Token rows of shape `[num_tokens, d_model]`
    fn route(&self, hidden_states: &Tensor) -> Result<Routing>;

    /// Experts selected per token.
    fn top_k(&self) -> usize;

    /// Number of experts across all workers.
    fn total_experts(&self) -> usize;

    /// Names of the trainable parameters, relative to the gate module.
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Linear scoring over all experts, top-k selection, softmax over the
/// selected scores.
pub struct NaiveGate {
    gate: Linear,
    total_experts: usize,
    top_k: usize,
}

impl NaiveGate {
    pub fn new(d_model: usize, total_experts: usize, top_k: usize, vb: VarBuilder) -> Result<Self> {
        if top_k == 0 || top_k > total_experts {
            return Err(MoEError::InvalidConfig(format!(
                "top_k {top_k} must be in 1..={total_experts}"
            )));
        }
        let gate = candle_nn::linear(d_model, total_experts, vb)?;
        Ok(Self {
            gate,
            total_experts,
            top_k,
        })
    }

    /// Raw scores, shape `[num_tokens, total_experts]`.
    pub fn logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        Ok(self.gate.forward(hidden_states)?)
    }
}

impl Gate for NaiveGate {
    fn route(&self, hidden_states: &Tensor) -> Result<Routing> {
        let num_tokens = hidden_states.dim(0)?;
        if num_tokens == 0 {
            let device = hidden_states.device();
            return Ok(Routing::new(
                Tensor::zeros((0, self.top_k), DType::U32, device)?,
                Some(Tensor::zeros((0, self.top_k), hidden_states.dtype(), device)?),
            ));
        }

        let logits = self.logits(hidden_states)?;
        let (top_values, top_indices) = top_k_with_indices(&logits, self.top_k)?;
        let weights = candle_nn::ops::softmax(&top_values, D::Minus1)?;
        Ok(Routing::new(top_indices, Some(weights)))
    }

    fn top_k(&self) -> usize {
        self.top_k
    }

    fn total_experts(&self) -> usize {
        self.total_experts
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["weight".to_string(), "bias".to_string()]
    }
}

/// Get the `k` largest values of the last dimension and their indices.
///
/// # Returns
/// * `values` - Shape `[..., k]`, descending
/// * `indices` - Shape `[..., k]`, dtype u32
pub fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.dims().len() - 1;
    let n = tensor.dim(dim)?;
    let k = k.min(n);

    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = sorted_indices.narrow(dim, 0, k)?.contiguous()?;
    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;

    Ok((top_k_values, top_k_indices))
}
