//! Dispatch plan: which assignment goes where, and in which order.
//!
//! A plan is derived once per forward pass from the routing decision and the
//! exchanged [`CountMatrix`], and is shared by scatter and gather so that the
//! gather is the exact inverse of the scatter.
//!
//! ## Buffer layouts
//!
//! ```text
//! send buffer   : [dest rank][local expert]   (rows in arrival order within a segment)
//! recv buffer   : [src rank][local expert]    (what one fused all_to_all_v delivers)
//! expert batches: [local expert][src rank]    (what the expert executor consumes)
//! ```
//!
//! Segment sizes are `send_count[dest][j]` and `recv_count[src][j]`.

use super::counter::{CountMatrix, LocalCounts};
use super::error::{MoEError, Result};
use super::expert_map::ExpertMap;

/// Per-pass mapping from experts to the token rows they compute.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    num_tokens: usize,
    top_k: usize,
    num_expert: usize,
    world_size: usize,
    rank: usize,
    /// Flat assignment indices (`token * top_k + k`) in send-buffer order.
    pos: Vec<usize>,
    /// `[dest][local]`: rows this worker sends to expert `(dest, local)`.
    send_count: Vec<usize>,
    /// `[src][local]`: rows this worker receives from `src` for local expert `local`.
    recv_count: Vec<usize>,
    /// `[local]`: rows each local expert computes.
    fwd_expert_count: Vec<usize>,
    matrix: CountMatrix,
}

impl DispatchPlan {
    /// Build the plan for the worker viewed by `map`.
    ///
    /// # Arguments
    /// * `map` - Expert placement, as seen from this worker
    /// * `expert_ids` - Flattened `[num_tokens * top_k]` global expert ids
    /// * `keep` - Optional per-token flag; dropped tokens are not dispatched
    /// * `top_k` - Assignments per token
    /// * `local` - This worker's counts (see [`super::counter::count_local`])
    /// * `matrix` - Exchanged counts of every worker
    pub fn build(
        map: &ExpertMap,
        expert_ids: &[u32],
        keep: Option<&[bool]>,
        top_k: usize,
        local: &LocalCounts,
        matrix: CountMatrix,
    ) -> Result<Self> {
        let num_expert = map.num_expert();
        let world_size = map.world_size();
        let rank = map.rank();
        let num_tokens = expert_ids.len() / top_k;

        let kept_tokens = match keep {
            Some(keep) => keep.iter().filter(|&&k| k).count(),
            None => num_tokens,
        };
        if local.kept_assignments != kept_tokens * top_k {
            return Err(MoEError::CountSumMismatch {
                expected: kept_tokens * top_k,
                actual: local.kept_assignments,
            });
        }
        if matrix.row(rank) != local.per_expert.as_slice() {
            return Err(MoEError::CountSumMismatch {
                expected: local.kept_assignments,
                actual: matrix.row(rank).iter().sum(),
            });
        }

        let slot_key = |global: usize| {
            let (owner, local_id) = map.slot(global);
            owner * num_expert + local_id
        };

        let mut send_count = vec![0usize; world_size * num_expert];
        for (global, &count) in local.per_expert.iter().enumerate() {
            send_count[slot_key(global)] += count;
        }

        // Stable counting sort by (dest rank, local expert).
        let mut offsets = exclusive_prefix(&send_count);
        let mut pos = vec![0usize; local.kept_assignments];
        for (flat_idx, &id) in expert_ids.iter().enumerate() {
            if keep.is_some_and(|keep| !keep[flat_idx / top_k]) {
                continue;
            }
            let key = slot_key(id as usize);
            pos[offsets[key]] = flat_idx;
            offsets[key] += 1;
        }

        let mut recv_count = vec![0usize; world_size * num_expert];
        for src in 0..world_size {
            for j in 0..num_expert {
                recv_count[src * num_expert + j] = matrix.get(src, map.to_global(j));
            }
        }
        let fwd_expert_count: Vec<usize> = (0..num_expert)
            .map(|j| (0..world_size).map(|src| recv_count[src * num_expert + j]).sum())
            .collect();

        Ok(Self {
            num_tokens,
            top_k,
            num_expert,
            world_size,
            rank,
            pos,
            send_count,
            recv_count,
            fwd_expert_count,
            matrix,
        })
    }

    /// Tokens in the flattened input, dropped ones included.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn num_expert(&self) -> usize {
        self.num_expert
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Flat assignment indices in send-buffer order.
    pub fn pos(&self) -> &[usize] {
        &self.pos
    }

    /// Source token row of every send-buffer row.
    pub fn token_indices(&self) -> Vec<u32> {
        self.pos.iter().map(|&p| (p / self.top_k) as u32).collect()
    }

    /// Rows each local expert computes.
    pub fn fwd_expert_count(&self) -> &[usize] {
        &self.fwd_expert_count
    }

    /// `[dest][local]` send counts.
    pub fn send_count(&self) -> &[usize] {
        &self.send_count
    }

    /// `[src][local]` receive counts.
    pub fn recv_count(&self) -> &[usize] {
        &self.recv_count
    }

    /// Exchanged counts of every worker.
    pub fn matrix(&self) -> &CountMatrix {
        &self.matrix
    }

    /// Rows sent to each destination worker.
    pub fn send_splits(&self) -> Vec<usize> {
        row_sums(&self.send_count, self.world_size, self.num_expert)
    }

    /// Rows received from each source worker.
    pub fn recv_splits(&self) -> Vec<usize> {
        row_sums(&self.recv_count, self.world_size, self.num_expert)
    }

    /// Rows sent to each destination for one local expert slot.
    pub fn slot_send_splits(&self, slot: usize) -> Vec<usize> {
        column(&self.send_count, self.world_size, self.num_expert, slot)
    }

    /// Rows received from each source for one local expert slot.
    pub fn slot_recv_splits(&self, slot: usize) -> Vec<usize> {
        column(&self.recv_count, self.world_size, self.num_expert, slot)
    }

    pub fn total_send(&self) -> usize {
        self.pos.len()
    }

    pub fn total_recv(&self) -> usize {
        self.fwd_expert_count.iter().sum()
    }

    /// Rows this worker sends to other workers (self-sends excluded).
    pub fn remote_send_rows(&self) -> usize {
        self.send_splits()
            .iter()
            .enumerate()
            .filter(|&(dest, _)| dest != self.rank)
            .map(|(_, &rows)| rows)
            .sum()
    }

    /// Rows this worker receives from other workers (self-sends excluded).
    pub fn remote_recv_rows(&self) -> usize {
        self.recv_splits()
            .iter()
            .enumerate()
            .filter(|&(src, _)| src != self.rank)
            .map(|(_, &rows)| rows)
            .sum()
    }

    /// Index reading the recv buffer (`[src][local]`) in expert-major order.
    pub fn recv_to_expert_major(&self) -> Vec<u32> {
        transpose_segments(&self.recv_count, self.world_size, self.num_expert)
    }

    /// Index reading expert batches (`[local][src]`) back in recv-buffer order.
    pub fn expert_major_to_recv(&self) -> Vec<u32> {
        let transposed = transpose_counts(&self.recv_count, self.world_size, self.num_expert);
        transpose_segments(&transposed, self.num_expert, self.world_size)
    }

    /// Index reading the send buffer (`[dest][local]`) in slot-major order.
    pub fn send_to_slot_major(&self) -> Vec<u32> {
        transpose_segments(&self.send_count, self.world_size, self.num_expert)
    }

    /// Index reading slot-major returns (`[local][dest]`) back in send-buffer order.
    pub fn slot_major_to_send(&self) -> Vec<u32> {
        let transposed = transpose_counts(&self.send_count, self.world_size, self.num_expert);
        transpose_segments(&transposed, self.num_expert, self.world_size)
    }

    /// Rows per local expert slot when `rows` rows arrive in recv-buffer
    /// order. Segments fill in order; surplus rows land on the last slot.
    pub fn recv_rows_per_slot(&self, rows: usize) -> Vec<usize> {
        fill_segments(&self.recv_count, self.world_size, self.num_expert, rows)
    }

    /// Same as [`Self::recv_rows_per_slot`] for rows returned in send-buffer order.
    pub fn send_rows_per_slot(&self, rows: usize) -> Vec<usize> {
        fill_segments(&self.send_count, self.world_size, self.num_expert, rows)
    }

    /// Rows sent per local expert slot, over all destinations.
    pub fn send_per_slot(&self) -> Vec<usize> {
        (0..self.num_expert)
            .map(|slot| self.slot_send_splits(slot).iter().sum())
            .collect()
    }

    /// Check the conservation invariants of the plan.
    pub fn validate(&self) -> Result<()> {
        let sent: usize = self.send_count.iter().sum();
        if sent != self.pos.len() {
            return Err(MoEError::CountSumMismatch {
                expected: self.pos.len(),
                actual: sent,
            });
        }
        let received: usize = self.recv_count.iter().sum();
        if received != self.total_recv() {
            return Err(MoEError::CountSumMismatch {
                expected: received,
                actual: self.total_recv(),
            });
        }
        Ok(())
    }
}

fn exclusive_prefix(counts: &[usize]) -> Vec<usize> {
    let mut acc = 0;
    counts
        .iter()
        .map(|&c| {
            let start = acc;
            acc += c;
            start
        })
        .collect()
}

fn fill_segments(counts: &[usize], outer: usize, inner: usize, rows: usize) -> Vec<usize> {
    let mut per_inner = vec![0usize; inner];
    let mut remaining = rows;
    for o in 0..outer {
        for (i, filled) in per_inner.iter_mut().enumerate() {
            let take = counts[o * inner + i].min(remaining);
            *filled += take;
            remaining -= take;
        }
    }
    if let Some(last) = per_inner.last_mut() {
        *last += remaining;
    }
    per_inner
}

fn row_sums(counts: &[usize], rows: usize, cols: usize) -> Vec<usize> {
    (0..rows)
        .map(|r| counts[r * cols..(r + 1) * cols].iter().sum())
        .collect()
}

fn column(counts: &[usize], rows: usize, cols: usize, col: usize) -> Vec<usize> {
    (0..rows).map(|r| counts[r * cols + col]).collect()
}

fn transpose_counts(counts: &[usize], rows: usize, cols: usize) -> Vec<usize> {
    let mut out = vec![0usize; counts.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = counts[r * cols + c];
        }
    }
    out
}

/// For a buffer of segments laid out `[a][b]` with sizes `counts[a * inner + b]`,
/// return the row index that reads it in `[b][a]` order. Rows keep their
/// relative order inside each segment.
fn transpose_segments(counts: &[usize], outer: usize, inner: usize) -> Vec<u32> {
    let offsets = exclusive_prefix(counts);
    let mut index = Vec::with_capacity(counts.iter().sum());
    for b in 0..inner {
        for a in 0..outer {
            let seg = a * inner + b;
            let start = offsets[seg];
            index.extend((start..start + counts[seg]).map(|row| row as u32));
        }
    }
    index
}
