//! Capability counting: how many tokens each expert will compute.
//!
//! Counting happens in two steps:
//!
//! 1. [`count_local`]: every worker counts its own assignments per global
//!    expert id (duplicates within one token count separately).
//! 2. [`exchange_counts`]: the local vectors are all-gathered into a
//!    [`CountMatrix`], so every worker knows exactly how many rows it will
//!    receive for each local expert before any token data moves.

use candle_core::{Device, Tensor};

use super::error::{MoEError, Result};
use super::expert_map::ExpertMap;
use crate::distributed::DeviceCommunicator;

/// Per-worker assignment counts, indexed by global expert id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCounts {
    /// `per_expert[e]` = assignments from this worker to global expert `e`.
    pub per_expert: Vec<usize>,
    /// Assignments that were counted (dropped tokens excluded).
    pub kept_assignments: usize,
}

/// Count this worker's assignments per global expert.
///
/// # Arguments
/// * `expert_ids` - Flattened `[num_tokens * top_k]` global expert ids
/// * `keep` - Optional per-token flag; `false` drops every assignment of that token
/// * `top_k` - Assignments per token
/// * `total_experts` - Number of experts across all workers
pub fn count_local(
    expert_ids: &[u32],
    keep: Option<&[bool]>,
    top_k: usize,
    total_experts: usize,
) -> Result<LocalCounts> {
    let mut per_expert = vec![0usize; total_experts];
    let mut kept_assignments = 0;

    for (flat_idx, &id) in expert_ids.iter().enumerate() {
        if let Some(keep) = keep {
            if !keep[flat_idx / top_k] {
                continue;
            }
        }
        let expert = id as usize;
        if expert >= total_experts {
            return Err(MoEError::ExpertOutOfRange {
                expert,
                total_experts,
            });
        }
        per_expert[expert] += 1;
        kept_assignments += 1;
    }

    Ok(LocalCounts {
        per_expert,
        kept_assignments,
    })
}

/// Job-wide assignment counts: `counts[src][e]` = rows worker `src` sends to expert `e`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMatrix {
    world_size: usize,
    total_experts: usize,
    counts: Vec<usize>,
}

impl CountMatrix {
    /// Build from a row-major `[world_size * total_experts]` vector.
    pub fn from_rows(world_size: usize, total_experts: usize, counts: Vec<usize>) -> Self {
        assert_eq!(
            counts.len(),
            world_size * total_experts,
            "count matrix must be world_size x total_experts"
        );
        Self {
            world_size,
            total_experts,
            counts,
        }
    }

    #[inline]
    pub fn get(&self, src: usize, expert: usize) -> usize {
        self.counts[src * self.total_experts + expert]
    }

    /// Counts contributed by one worker, indexed by global expert id.
    pub fn row(&self, src: usize) -> &[usize] {
        let start = src * self.total_experts;
        &self.counts[start..start + self.total_experts]
    }

    /// Rows each global expert will compute, summed over every source worker.
    pub fn expert_totals(&self) -> Vec<usize> {
        (0..self.total_experts)
            .map(|e| (0..self.world_size).map(|src| self.get(src, e)).sum())
            .collect()
    }

    /// `fwd_expert_count` of the worker viewed by `map`, indexed by local expert.
    pub fn fwd_expert_count(&self, map: &ExpertMap) -> Vec<usize> {
        let totals = self.expert_totals();
        map.local_global_ids().map(|id| totals[id]).collect()
    }

    /// Sum of every entry.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[inline]
    pub fn total_experts(&self) -> usize {
        self.total_experts
    }
}

/// Share every worker's local counts with every other worker.
///
/// Must complete on all workers before token data is exchanged: receive
/// buffer sizes come from this matrix.
pub fn exchange_counts(
    local: &LocalCounts,
    comm: &dyn DeviceCommunicator,
    device: &Device,
) -> Result<CountMatrix> {
    let world_size = comm.process_group().world_size();
    let total_experts = local.per_expert.len();

    if world_size == 1 {
        return Ok(CountMatrix::from_rows(
            1,
            total_experts,
            local.per_expert.clone(),
        ));
    }

    let counts_tensor = Tensor::from_vec(
        local.per_expert.iter().map(|&c| c as u32).collect::<Vec<_>>(),
        total_experts,
        device,
    )?;
    let gathered: Vec<u32> = comm.all_gather(&counts_tensor, 0)?.to_vec1()?;
    if gathered.len() != world_size * total_experts {
        return Err(MoEError::CountSumMismatch {
            expected: world_size * total_experts,
            actual: gathered.len(),
        });
    }

    Ok(CountMatrix::from_rows(
        world_size,
        total_experts,
        gathered.into_iter().map(|c| c as usize).collect(),
    ))
}
