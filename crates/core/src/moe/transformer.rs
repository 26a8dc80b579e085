//! Transformer MLP adapter.
//!
//! Drop-in replacement for the feed-forward block of a transformer layer:
//! takes `[..., d_model]`, runs one MoE pass over the flattened tokens and
//! returns the output in the input's shape together with the pass telemetry.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::context::PassContext;
use super::error::{MoEError, Result};
use super::layer::MoELayer;
use super::record::CommRecord;
use crate::config::MoEConfig;
use crate::distributed::DeviceCommunicator;

/// Output of [`TransformerMlp::forward`].
#[derive(Debug)]
pub struct MlpOutput {
    /// Same shape as the input.
    pub output: Tensor,
    /// Modelled microseconds saved by fusing transfers; see [`CommRecord::fusion_cost`].
    pub fusion_cost: f64,
    /// Seconds spent in collectives.
    pub comm_time: f64,
    /// Bytes sent to other workers, scatter and gather.
    pub traffic_size: u64,
    /// Rows each local expert computed.
    pub fwd_expert_count: Vec<usize>,
    pub record: CommRecord,
}

pub struct TransformerMlp {
    layer: MoELayer,
}

impl TransformerMlp {
    /// Build the MoE layer with its default gate and MLP experts.
    pub fn new(config: MoEConfig, vb: VarBuilder, comm: Arc<dyn DeviceCommunicator>) -> Result<Self> {
        Ok(Self {
            layer: MoELayer::new(config, vb, comm)?,
        })
    }

    pub fn from_layer(layer: MoELayer) -> Self {
        Self { layer }
    }

    /// Forward pass over an input of shape `[..., d_model]`.
    pub fn forward(&self, inp: &Tensor, ctx: &PassContext) -> Result<MlpOutput> {
        let shape = inp.dims().to_vec();
        let d_model = self.layer.config().d_model;
        let Some((&width, leading)) = shape.split_last() else {
            return Err(MoEError::ShapeMismatch {
                expected: d_model,
                actual: 0,
            });
        };
        if width != d_model {
            return Err(MoEError::ShapeMismatch {
                expected: d_model,
                actual: width,
            });
        }

        let num_tokens: usize = leading.iter().product();
        let flat = inp.reshape((num_tokens, d_model))?;
        let out = self.layer.forward(&flat, ctx)?;
        let output = out.output.reshape(shape)?;

        Ok(MlpOutput {
            output,
            fusion_cost: out.record.fusion_cost,
            comm_time: out.record.comm_time_secs(),
            traffic_size: out.record.traffic_size(),
            fwd_expert_count: out.fwd_expert_count,
            record: out.record,
        })
    }

    /// `(parameter name, communication tag)` for every trainable parameter.
    ///
    /// Gate parameters are tagged `gate`; expert parameters carry the
    /// configured `expert_dp_comm` mode.
    pub fn parallel_comm_tags(&self) -> Vec<(String, &'static str)> {
        let expert_tag = self.layer.config().expert_dp_comm.as_str();
        let gate = self
            .layer
            .gate()
            .parameter_names()
            .into_iter()
            .map(|name| (format!("gate.{name}"), "gate"));
        let experts = self
            .layer
            .experts()
            .parameter_names()
            .into_iter()
            .map(|name| (format!("experts.{name}"), expert_tag));
        gate.chain(experts).collect()
    }

    pub fn layer(&self) -> &MoELayer {
        &self.layer
    }
}
