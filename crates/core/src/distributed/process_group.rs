//! Process group abstractions for expert-parallel execution.
//!
//! A process group is the set of workers that take part in the MoE
//! collectives. Every worker owns a disjoint shard of experts and of tokens
//! and all of them run the same pass in lockstep.

/// Trait for process group operations.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this worker (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of workers in the group.
    fn world_size(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-worker group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Plain rank/size pair.
///
/// Useful on its own for single-worker execution and as the group identity of
/// the in-process communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create a single-worker group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a group identity with a specific rank/size.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
