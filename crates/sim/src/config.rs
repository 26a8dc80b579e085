//! Simulation configuration.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file given with `--config`
//! 3. Default values (lowest priority)

use std::fs;
use std::path::Path;

use fmoe_core::config::MoEConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation settings stored in TOML format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Tokens fed to the layer on every worker.
    pub tokens_per_worker: usize,
    /// Allow transfer fusion.
    pub fuse_token: bool,
    /// Layer configuration shared by all workers.
    pub moe: MoEConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tokens_per_worker: 64,
            fuse_token: false,
            moe: MoEConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply CLI overrides on top of this config.
    pub fn merge(&mut self, overrides: &Overrides) {
        if let Some(world_size) = overrides.world_size {
            self.moe.world_size = world_size;
        }
        if let Some(num_expert) = overrides.num_expert {
            self.moe.num_expert = num_expert;
        }
        if let Some(d_model) = overrides.d_model {
            self.moe.d_model = d_model;
        }
        if let Some(d_hidden) = overrides.d_hidden {
            self.moe.d_hidden = d_hidden;
        }
        if let Some(top_k) = overrides.top_k {
            self.moe.top_k = top_k;
        }
        if let Some(tokens) = overrides.tokens {
            self.tokens_per_worker = tokens;
        }
        if overrides.fuse_token {
            self.fuse_token = true;
        }
    }
}

/// Values given on the command line; `None` keeps the file or default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub world_size: Option<usize>,
    pub num_expert: Option<usize>,
    pub d_model: Option<usize>,
    pub d_hidden: Option<usize>,
    pub top_k: Option<usize>,
    pub tokens: Option<usize>,
    pub fuse_token: bool,
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
