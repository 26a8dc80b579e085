//! Fusion policy for token exchanges.
//!
//! Without fusion every `(source, destination, local expert)` transfer is its
//! own message: the dispatcher runs one all-to-all round per local expert
//! slot. With fusion all slots bound for the same worker travel as one
//! count-indexed message and a single all-to-all covers the whole pass.
//!
//! The decision is cost-modelled from the job-wide [`CountMatrix`], which
//! every worker holds after the count exchange, so all workers reach the same
//! decision and issue the same number of collectives.
//!
//! ```text
//! cost(unfused) = msgs(src,dst,expert) * latency + bytes / bandwidth
//! cost(fused)   = msgs(src,dst)        * latency + bytes / bandwidth + bytes * pack
//! ```

use serde::{Deserialize, Serialize};

use super::counter::CountMatrix;
use super::expert_map::ExpertMap;

/// Constants of the communication cost model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Fixed cost of one message, in microseconds.
    pub latency_us: f64,
    /// Link bandwidth, in bytes per microsecond.
    pub bandwidth_bytes_per_us: f64,
    /// Cost of packing one byte into a fused message, in microseconds.
    pub pack_us_per_byte: f64,
    /// Fuse whenever `fuse_token` is set, even when the model predicts a loss.
    pub force: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            latency_us: 8.0,
            bandwidth_bytes_per_us: 12_500.0,
            pack_us_per_byte: 1.0e-5,
            force: false,
        }
    }
}

/// Outcome of the fusion decision for one pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionDecision {
    /// Whether the exchanges of this pass are fused.
    pub fused: bool,
    /// Modelled cost of one direction without fusion, in microseconds.
    pub unfused_cost_us: f64,
    /// Modelled cost of one direction with fusion, in microseconds.
    pub fused_cost_us: f64,
}

impl FusionDecision {
    /// Baseline decision: no merging, nothing modelled.
    pub fn identity() -> Self {
        Self {
            fused: false,
            unfused_cost_us: 0.0,
            fused_cost_us: 0.0,
        }
    }

    /// Modelled microseconds saved over scatter and gather together.
    ///
    /// Zero when not fused; negative when a forced fusion costs more.
    pub fn fusion_cost(&self) -> f64 {
        if self.fused {
            2.0 * (self.unfused_cost_us - self.fused_cost_us)
        } else {
            0.0
        }
    }
}

/// Cross-worker traffic of one exchange direction, summed over the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficShape {
    /// Non-empty `(src, dst, local expert)` transfers with `src != dst`.
    pub expert_messages: usize,
    /// Non-empty `(src, dst)` pairs with `src != dst`.
    pub worker_messages: usize,
    /// Rows crossing a worker boundary.
    pub rows: usize,
}

impl TrafficShape {
    /// Measure the cross-worker part of a count matrix.
    pub fn from_counts(matrix: &CountMatrix, map: &ExpertMap) -> Self {
        let world_size = matrix.world_size();
        let mut shape = Self::default();
        let mut pair_rows = vec![0usize; world_size * world_size];

        for src in 0..world_size {
            for (expert, &rows) in matrix.row(src).iter().enumerate() {
                let dst = map.owner_rank(expert);
                if rows == 0 || dst == src {
                    continue;
                }
                shape.expert_messages += 1;
                shape.rows += rows;
                pair_rows[src * world_size + dst] += rows;
            }
        }
        shape.worker_messages = pair_rows.iter().filter(|&&rows| rows > 0).count();
        shape
    }
}

/// Decides whether per-expert transfers are merged into per-worker messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionPolicy {
    config: FusionConfig,
}

impl FusionPolicy {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Modelled cost of one direction, in microseconds.
    pub fn cost_us(&self, shape: &TrafficShape, bytes_per_row: usize, fused: bool) -> f64 {
        let bytes = (shape.rows * bytes_per_row) as f64;
        let transfer = bytes / self.config.bandwidth_bytes_per_us;
        if fused {
            shape.worker_messages as f64 * self.config.latency_us
                + transfer
                + bytes * self.config.pack_us_per_byte
        } else {
            shape.expert_messages as f64 * self.config.latency_us + transfer
        }
    }

    /// Decide for one pass.
    ///
    /// With `fuse_token == false`, a single worker, or no row crossing a
    /// worker boundary, this is always [`FusionDecision::identity`].
    pub fn decide(
        &self,
        matrix: &CountMatrix,
        map: &ExpertMap,
        bytes_per_row: usize,
        fuse_token: bool,
    ) -> FusionDecision {
        if !fuse_token {
            return FusionDecision::identity();
        }
        let shape = TrafficShape::from_counts(matrix, map);
        if map.world_size() == 1 || shape.rows == 0 {
            return FusionDecision::identity();
        }
        let unfused_cost_us = self.cost_us(&shape, bytes_per_row, false);
        let fused_cost_us = self.cost_us(&shape, bytes_per_row, true);
        let fused = self.config.force || fused_cost_us < unfused_cost_us;

        tracing::trace!(
            expert_messages = shape.expert_messages,
            worker_messages = shape.worker_messages,
            rows = shape.rows,
            unfused_cost_us,
            fused_cost_us,
            fused,
            "fusion decision"
        );

        FusionDecision {
            fused,
            unfused_cost_us,
            fused_cost_us,
        }
    }
}
