//! Expert placement across workers.
//!
//! An expert is identified globally by an id in `0..total_experts` and
//! physically by `(worker_rank, local_expert_index)`. Every worker hosts
//! exactly `num_expert` experts, so `total_experts = num_expert * world_size`.
//!
//! ## Placement Strategies
//!
//! - **Linear**: worker `w` owns `[w * num_expert, (w + 1) * num_expert)`.
//!   Global order equals worker-major order.
//! - **RoundRobin**: worker `w` owns `w, w + world_size, w + 2 * world_size, ...`.
//!
//! ## Example
//!
//! ```ignore
//! use fmoe_core::moe::{ExpertMap, ExpertPlacement};
//!
//! // 4 experts per worker, 2 workers, viewed from rank 1
//! let map = ExpertMap::new(4, 2, 1, ExpertPlacement::Linear);
//! assert_eq!(map.slot(5), (1, 1));
//! assert_eq!(map.to_local(5), Some(1));
//! assert_eq!(map.to_local(2), None);
//! ```

use serde::{Deserialize, Serialize};

/// Expert placement strategy across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertPlacement {
    /// Contiguous blocks of `num_expert` ids per worker.
    #[default]
    Linear,
    /// Ids dealt out to workers in turn.
    RoundRobin,
}

/// Maps global expert ids to `(worker_rank, local_expert_index)` for one worker's view.
#[derive(Debug, Clone)]
pub struct ExpertMap {
    num_expert: usize,
    world_size: usize,
    rank: usize,
    placement: ExpertPlacement,
}

impl ExpertMap {
    /// Create the expert map seen by `rank`.
    ///
    /// # Panics
    /// Panics if `num_expert` or `world_size` is 0, or `rank >= world_size`.
    pub fn new(
        num_expert: usize,
        world_size: usize,
        rank: usize,
        placement: ExpertPlacement,
    ) -> Self {
        assert!(num_expert > 0, "num_expert must be > 0");
        assert!(world_size > 0, "world_size must be > 0");
        assert!(rank < world_size, "rank must be < world_size");
        Self {
            num_expert,
            world_size,
            rank,
            placement,
        }
    }

    /// Expert map for a single worker: every expert is local, mapping is identity.
    pub fn single_worker(num_expert: usize) -> Self {
        Self::new(num_expert, 1, 0, ExpertPlacement::Linear)
    }

    /// Owning worker and local index of a global expert id.
    #[inline]
    pub fn slot(&self, global_id: usize) -> (usize, usize) {
        debug_assert!(global_id < self.total_experts());
        match self.placement {
            ExpertPlacement::Linear => (global_id / self.num_expert, global_id % self.num_expert),
            ExpertPlacement::RoundRobin => {
                (global_id % self.world_size, global_id / self.world_size)
            }
        }
    }

    /// Global id of the expert at `(rank, local_id)`.
    #[inline]
    pub fn global_id(&self, rank: usize, local_id: usize) -> usize {
        debug_assert!(rank < self.world_size && local_id < self.num_expert);
        match self.placement {
            ExpertPlacement::Linear => rank * self.num_expert + local_id,
            ExpertPlacement::RoundRobin => local_id * self.world_size + rank,
        }
    }

    /// Get the worker that owns a given global expert id.
    #[inline]
    pub fn owner_rank(&self, global_id: usize) -> usize {
        self.slot(global_id).0
    }

    /// Check if a global expert id is hosted on this worker.
    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        global_id < self.total_experts() && self.owner_rank(global_id) == self.rank
    }

    /// Convert a global expert id to this worker's local index.
    ///
    /// Returns `None` if the expert lives elsewhere or does not exist.
    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        if global_id >= self.total_experts() {
            return None;
        }
        let (owner, local) = self.slot(global_id);
        (owner == self.rank).then_some(local)
    }

    /// Convert one of this worker's local indices to a global expert id.
    #[inline]
    pub fn to_global(&self, local_id: usize) -> usize {
        self.global_id(self.rank, local_id)
    }

    /// Experts hosted per worker.
    #[inline]
    pub fn num_expert(&self) -> usize {
        self.num_expert
    }

    /// Experts across all workers.
    #[inline]
    pub fn total_experts(&self) -> usize {
        self.num_expert * self.world_size
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[inline]
    pub fn placement(&self) -> ExpertPlacement {
        self.placement
    }

    /// Global ids of this worker's experts, in local order.
    pub fn local_global_ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_expert).map(move |local| self.to_global(local))
    }
}
