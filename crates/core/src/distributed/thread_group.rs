//! In-process multi-worker communicator.
//!
//! Every worker of the group runs on its own thread and holds one
//! [`ThreadCommunicator`]. Collectives rendezvous through a shared slot table:
//! each rank publishes its payload, waits for the others, reads what it
//! needs, and waits again before the slots can be reused.
//!
//! A rank that hits an error calls [`DeviceCommunicator::abort`]. Peers
//! blocked in a collective wake up with [`DistributedError::Collective`], and
//! every later collective of the group fails the same way. A rank that never
//! arrives and never aborts still blocks the rest of the group.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use candle_core::Tensor;

use super::communicator::{check_splits, DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// One published contribution: the tensor plus the sender's split vector
/// (empty for collectives that do not split).
type Slot = Option<(Tensor, Vec<usize>)>;

struct Round {
    slots: Vec<Slot>,
    /// Ranks waiting at the current barrier.
    arrived: usize,
    /// Bumped each time every rank has arrived.
    generation: u64,
    /// Set once by the first rank that aborts.
    aborted: Option<String>,
}

struct GroupState {
    world_size: usize,
    round: Mutex<Round>,
    cvar: Condvar,
}

fn peer_panicked(op: &'static str) -> DistributedError {
    DistributedError::Collective {
        op,
        reason: "a peer worker panicked during the exchange".to_string(),
    }
}

impl GroupState {
    fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, Round>> {
        self.round.lock().map_err(|_| peer_panicked(op))
    }

    fn check_abort(round: &Round, op: &'static str) -> Result<()> {
        match &round.aborted {
            Some(reason) => Err(DistributedError::Collective {
                op,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Block until every rank has arrived or the group is aborted.
    fn wait_all<'a>(
        &'a self,
        mut round: MutexGuard<'a, Round>,
        op: &'static str,
    ) -> Result<MutexGuard<'a, Round>> {
        Self::check_abort(&round, op)?;
        let generation = round.generation;
        round.arrived += 1;
        if round.arrived == self.world_size {
            round.arrived = 0;
            round.generation += 1;
            self.cvar.notify_all();
        } else {
            // A barrier that completed before the abort still counts.
            while round.generation == generation {
                Self::check_abort(&round, op)?;
                round = self.cvar.wait(round).map_err(|_| peer_panicked(op))?;
            }
        }
        Ok(round)
    }
}

/// Communicator for one worker of an in-process group.
pub struct ThreadCommunicator {
    pg: LocalProcessGroup,
    state: Arc<GroupState>,
}

impl ThreadCommunicator {
    /// Create the `world_size` communicators of one group, indexed by rank.
    ///
    /// # Panics
    /// Panics if `world_size == 0`.
    pub fn group(world_size: usize) -> Vec<ThreadCommunicator> {
        assert!(world_size > 0, "world_size must be > 0");
        let state = Arc::new(GroupState {
            world_size,
            round: Mutex::new(Round {
                slots: vec![None; world_size],
                arrived: 0,
                generation: 0,
                aborted: None,
            }),
            cvar: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadCommunicator {
                pg: LocalProcessGroup::with_rank(rank, world_size),
                state: Arc::clone(&state),
            })
            .collect()
    }

    /// Publish `payload`, wait for every rank, and return all contributions
    /// in rank order.
    fn rendezvous(
        &self,
        op: &'static str,
        tensor: &Tensor,
        splits: &[usize],
    ) -> Result<Vec<(Tensor, Vec<usize>)>> {
        let rank = self.pg.rank();
        let mut round = self.state.lock(op)?;
        round.slots[rank] = Some((tensor.clone(), splits.to_vec()));

        let round = self.state.wait_all(round, op)?;
        let gathered = round
            .slots
            .iter()
            .enumerate()
            .map(|(src, slot)| {
                slot.clone().ok_or_else(|| DistributedError::Collective {
                    op,
                    reason: format!("rank {src} published nothing"),
                })
            })
            .collect::<Result<Vec<_>>>();

        // Nobody may overwrite a slot before every rank has read it.
        drop(self.state.wait_all(round, op)?);
        gathered
    }
}

impl DeviceCommunicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.pg
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let contributions = self.rendezvous("all_reduce", tensor, &[])?;
        let mut iter = contributions.into_iter().map(|(t, _)| t);
        let mut acc = match iter.next() {
            Some(first) => first,
            None => return Ok(tensor.clone()),
        };
        for t in iter {
            acc = match op {
                ReduceOp::Sum => acc.add(&t)?,
                ReduceOp::Min => acc.minimum(&t)?,
                ReduceOp::Max => acc.maximum(&t)?,
            };
        }
        Ok(acc)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        let contributions = self.rendezvous("all_gather", tensor, &[])?;
        let tensors: Vec<Tensor> = contributions.into_iter().map(|(t, _)| t).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        let world_size = self.state.world_size;
        check_splits(tensor, send_splits, recv_splits, world_size)?;

        let rank = self.pg.rank();
        let contributions = self.rendezvous("all_to_all_v", tensor, send_splits)?;

        let mut pieces = Vec::with_capacity(world_size);
        for (src, (buf, their_splits)) in contributions.iter().enumerate() {
            let count = their_splits[rank];
            if count != recv_splits[src] {
                return Err(DistributedError::ShapeMismatch {
                    expected: vec![recv_splits[src]],
                    actual: vec![count],
                });
            }
            if count > 0 {
                let offset: usize = their_splits[..rank].iter().sum();
                pieces.push(buf.narrow(0, offset, count)?);
            }
        }

        if pieces.is_empty() {
            let mut dims = tensor.dims().to_vec();
            dims[0] = 0;
            return Ok(Tensor::zeros(dims.as_slice(), tensor.dtype(), tensor.device())?);
        }
        Ok(Tensor::cat(&pieces, 0)?)
    }

    fn abort(&self, reason: &str) {
        let mut round = match self.state.round.lock() {
            Ok(round) => round,
            Err(poisoned) => poisoned.into_inner(),
        };
        if round.aborted.is_none() {
            round.aborted = Some(format!("aborted by rank {}: {reason}", self.pg.rank()));
        }
        drop(round);
        self.state.cvar.notify_all();
    }
}
