//! Per-pass communication telemetry.

use std::time::Duration;

use super::fusion::FusionDecision;

/// Communication record of one forward pass on one worker.
///
/// `traffic_size` and `fusion_cost` are deterministic for a fixed plan and
/// fusion decision; `comm_time` is measured wall-clock time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommRecord {
    /// Time spent inside collectives (count exchange, scatter, gather).
    pub comm_time: Duration,
    /// Bytes this worker sent to other workers during scatter.
    pub scatter_bytes: u64,
    /// Bytes this worker sent to other workers during gather.
    pub gather_bytes: u64,
    /// Collective calls issued.
    pub collectives: usize,
    /// Whether the token exchanges were fused.
    pub fused: bool,
    /// Modelled microseconds saved by fusion (negative: overhead).
    pub fusion_cost: f64,
}

impl CommRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes moved across worker boundaries, both directions.
    pub fn traffic_size(&self) -> u64 {
        self.scatter_bytes + self.gather_bytes
    }

    /// `comm_time` in seconds.
    pub fn comm_time_secs(&self) -> f64 {
        self.comm_time.as_secs_f64()
    }

    pub(crate) fn add_collective(&mut self, elapsed: Duration) {
        self.comm_time += elapsed;
        self.collectives += 1;
    }

    pub(crate) fn apply_decision(&mut self, decision: &FusionDecision) {
        self.fused = decision.fused;
        self.fusion_cost = decision.fusion_cost();
    }

    /// Accumulate another record, e.g. from a second MoE layer of the same step.
    pub fn merge(&mut self, other: &CommRecord) {
        self.comm_time += other.comm_time;
        self.scatter_bytes += other.scatter_bytes;
        self.gather_bytes += other.gather_bytes;
        self.collectives += other.collectives;
        self.fused |= other.fused;
        self.fusion_cost += other.fusion_cost;
    }
}
