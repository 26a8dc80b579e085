//! Expert execution on expert-major batches.
//!
//! After dispatch the local experts' rows are laid out contiguously:
//! rows `[prefix[j], prefix[j] + fwd_expert_count[j])` belong to local expert
//! `j`. Every executor here walks that layout once and applies each expert
//! only to its own segment; experts with a zero count are skipped.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use super::error::{MoEError, Result};

/// Elementwise activation between the two expert projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exact GELU (erf form).
    #[default]
    Gelu,
    /// Tanh approximation of GELU.
    GeluTanh,
    Relu,
    Silu,
    Identity,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Gelu => xs.gelu_erf()?,
            Self::GeluTanh => xs.gelu()?,
            Self::Relu => xs.relu()?,
            Self::Silu => candle_nn::ops::silu(xs)?,
            Self::Identity => xs.clone(),
        };
        Ok(out)
    }
}

/// Computes all local experts over an expert-major batch.
pub trait ExpertCompute: Send + Sync {
    /// Run every local expert on its segment of `batch`.
    ///
    /// # Arguments
    /// * `batch` - Rows of shape `[sum(fwd_expert_count), d_model]`, expert-major
    /// * `fwd_expert_count` - Rows per local expert
    ///
    /// # Returns
    /// Tensor of shape `[sum(fwd_expert_count), d_model]` in the same layout.
    fn compute(&self, batch: &Tensor, fwd_expert_count: &[usize]) -> Result<Tensor>;

    /// Number of local experts.
    fn num_expert(&self) -> usize;

    /// Names of the trainable parameters, relative to the expert module.
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// `num_expert` independent linear maps stored as one stacked weight.
#[derive(Debug, Clone)]
pub struct GroupedLinear {
    /// Shape: [num_expert, out_features, in_features]
    weight: Tensor,
    /// Shape: [num_expert, out_features]
    bias: Option<Tensor>,
    num_expert: usize,
    in_features: usize,
    out_features: usize,
}

impl GroupedLinear {
    /// Load or initialize the stacked weights from `vb`.
    pub fn new(
        num_expert: usize,
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (num_expert, out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            let bound = 1.0 / (in_features as f64).sqrt();
            Some(vb.get_with_hints(
                (num_expert, out_features),
                "bias",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            num_expert,
            in_features,
            out_features,
        })
    }

    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (num_expert, out_features, in_features) = weight.dims3()?;
        if let Some(bias) = &bias {
            let (be, bo) = bias.dims2()?;
            if be != num_expert || bo != out_features {
                return Err(MoEError::InvalidConfig(format!(
                    "bias shape [{be}, {bo}] does not match weight [{num_expert}, {out_features}, {in_features}]"
                )));
            }
        }
        Ok(Self {
            weight,
            bias,
            num_expert,
            in_features,
            out_features,
        })
    }

    /// Apply expert `j` to segment `j` of `xs`.
    pub fn forward(&self, xs: &Tensor, fwd_expert_count: &[usize]) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;
        if cols != self.in_features {
            return Err(MoEError::ShapeMismatch {
                expected: self.in_features,
                actual: cols,
            });
        }
        check_counts(fwd_expert_count, self.num_expert, rows)?;

        let mut outputs = Vec::with_capacity(self.num_expert);
        let mut offset = 0;
        for (expert, &count) in fwd_expert_count.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let segment = xs.narrow(0, offset, count)?;
            offset += count;

            let w = self.weight.get(expert)?;
            let mut out = segment.matmul(&w.t()?)?;
            if let Some(bias) = &self.bias {
                out = out.broadcast_add(&bias.get(expert)?)?;
            }
            outputs.push(out);
        }

        if outputs.is_empty() {
            return Ok(Tensor::zeros(
                (0, self.out_features),
                xs.dtype(),
                xs.device(),
            )?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

fn check_counts(fwd_expert_count: &[usize], num_expert: usize, rows: usize) -> Result<()> {
    if fwd_expert_count.len() != num_expert {
        return Err(MoEError::InvalidConfig(format!(
            "expected {num_expert} expert counts, got {}",
            fwd_expert_count.len()
        )));
    }
    let total: usize = fwd_expert_count.iter().sum();
    if total != rows {
        return Err(MoEError::CountSumMismatch {
            expected: rows,
            actual: total,
        });
    }
    Ok(())
}

/// Two-layer expert FFN: `h4toh(act(htoh4(x)))`, one weight set per expert.
#[derive(Debug, Clone)]
pub struct MlpExperts {
    htoh4: GroupedLinear,
    h4toh: GroupedLinear,
    activation: Activation,
}

impl MlpExperts {
    pub fn new(
        num_expert: usize,
        d_model: usize,
        d_hidden: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let htoh4 = GroupedLinear::new(num_expert, d_model, d_hidden, true, vb.pp("htoh4"))?;
        let h4toh = GroupedLinear::new(num_expert, d_hidden, d_model, true, vb.pp("h4toh"))?;
        Ok(Self {
            htoh4,
            h4toh,
            activation,
        })
    }

    pub fn from_parts(htoh4: GroupedLinear, h4toh: GroupedLinear, activation: Activation) -> Self {
        Self {
            htoh4,
            h4toh,
            activation,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl ExpertCompute for MlpExperts {
    fn compute(&self, batch: &Tensor, fwd_expert_count: &[usize]) -> Result<Tensor> {
        let hidden = self.htoh4.forward(batch, fwd_expert_count)?;
        // Skipped experts contribute no rows, so the segment layout survives the activation.
        let hidden = self.activation.apply(&hidden)?;
        self.h4toh.forward(&hidden, fwd_expert_count)
    }

    fn num_expert(&self) -> usize {
        self.htoh4.num_expert
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(4);
        for (prefix, layer) in [("htoh4", &self.htoh4), ("h4toh", &self.h4toh)] {
            names.push(format!("{prefix}.weight"));
            if layer.bias.is_some() {
                names.push(format!("{prefix}.bias"));
            }
        }
        names
    }
}
