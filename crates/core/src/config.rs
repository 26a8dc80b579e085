use serde::{Deserialize, Serialize};

use crate::moe::{Activation, ExpertPlacement, FusionConfig, MoEError};

/// Data-parallel group the expert parameters are synchronized over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertDpComm {
    /// Experts are not replicated.
    #[default]
    None,
    /// Synchronized over the data-parallel group.
    Dp,
    /// Synchronized over every worker.
    World,
}

impl ExpertDpComm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Dp => "dp",
            Self::World => "world",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoEConfig {
    /// Experts hosted on each worker.
    pub num_expert: usize,
    pub d_model: usize,
    pub d_hidden: usize,
    pub activation: Activation,
    /// Workers in the MoE group.
    pub world_size: usize,
    pub top_k: usize,
    pub expert_dp_comm: ExpertDpComm,
    pub placement: ExpertPlacement,
    pub fusion: FusionConfig,
}

impl Default for MoEConfig {
    fn default() -> Self {
        Self {
            num_expert: 32,
            d_model: 1024,
            d_hidden: 4096,
            activation: Activation::Gelu,
            world_size: 1,
            top_k: 2,
            expert_dp_comm: ExpertDpComm::None,
            placement: ExpertPlacement::Linear,
            fusion: FusionConfig::default(),
        }
    }
}

impl MoEConfig {
    /// Experts across all workers.
    pub fn total_experts(&self) -> usize {
        self.num_expert * self.world_size
    }

    pub fn validate(&self) -> Result<(), MoEError> {
        let positive = [
            ("num_expert", self.num_expert),
            ("d_model", self.d_model),
            ("d_hidden", self.d_hidden),
            ("world_size", self.world_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(MoEError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.top_k == 0 || self.top_k > self.total_experts() {
            return Err(MoEError::InvalidConfig(format!(
                "top_k {} must be in 1..={}",
                self.top_k,
                self.total_experts()
            )));
        }
        if self.fusion.bandwidth_bytes_per_us <= 0.0 {
            return Err(MoEError::InvalidConfig(
                "fusion.bandwidth_bytes_per_us must be positive".to_string(),
            ));
        }
        if self.fusion.latency_us < 0.0 || self.fusion.pack_us_per_byte < 0.0 {
            return Err(MoEError::InvalidConfig(
                "fusion costs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
