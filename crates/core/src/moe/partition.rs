//! Expert placement across ranks.
//!
//! Experts are split into contiguous, balanced blocks: with `n` experts over
//! `r` ranks, the first `n mod r` ranks hold `n / r + 1` experts and the rest
//! hold `n / r`.
//!
//! ## Example
//!
//! ```ignore
//! use qmoe_core::moe::{partition_experts, ExpertShard};
//!
//! assert_eq!(partition_experts(8, 3)?, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]]);
//!
//! let shard = ExpertShard::new(8, 2, 3)?;
//! assert!(shard.is_local(7));
//! assert_eq!(shard.to_local(6), Some(0));
//! ```

use crate::distributed::ParallelContext;
use crate::error::{Error, Result};

/// Split `0..num_experts` into `num_ranks` ordered, disjoint, non-empty
/// blocks.
pub fn partition_experts(num_experts: usize, num_ranks: usize) -> Result<Vec<Vec<usize>>> {
    if num_ranks == 0 {
        return Err(Error::config("cannot partition experts over zero ranks"));
    }
    if num_ranks > num_experts {
        return Err(Error::config(format!(
            "rank count {num_ranks} exceeds expert count {num_experts}"
        )));
    }

    let base = num_experts / num_ranks;
    let extra = num_experts % num_ranks;
    let mut start = 0;
    Ok((0..num_ranks)
        .map(|rank| {
            let len = base + usize::from(rank < extra);
            let block = (start..start + len).collect();
            start += len;
            block
        })
        .collect())
}

/// The experts one rank owns, with global/local id lookups.
#[derive(Debug, Clone)]
pub struct ExpertShard {
    /// Global expert ids owned by this rank, ascending.
    experts: Vec<usize>,
    /// `Some(local_id)` for owned experts.
    global_to_local: Vec<Option<usize>>,
    rank: usize,
    world_size: usize,
    num_experts: usize,
}

impl ExpertShard {
    pub fn new(num_experts: usize, rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(Error::config(format!(
                "rank {rank} out of range for {world_size} ranks"
            )));
        }
        let experts = partition_experts(num_experts, world_size)?.swap_remove(rank);
        if experts.is_empty() {
            return Err(Error::config(format!("rank {rank} owns no experts")));
        }

        let mut global_to_local = vec![None; num_experts];
        for (local, &global) in experts.iter().enumerate() {
            global_to_local[global] = Some(local);
        }
        Ok(Self {
            experts,
            global_to_local,
            rank,
            world_size,
            num_experts,
        })
    }

    pub fn from_context(num_experts: usize, ctx: &ParallelContext) -> Result<Self> {
        Self::new(num_experts, ctx.rank(), ctx.world_size())
    }

    pub fn experts(&self) -> &[usize] {
        &self.experts
    }

    pub fn local_num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.to_local(global_id).is_some()
    }

    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        self.global_to_local.get(global_id).copied().flatten()
    }

    /// Rank owning `global_id`, or `None` if out of range.
    pub fn owner_rank(&self, global_id: usize) -> Option<usize> {
        if global_id >= self.num_experts {
            return None;
        }
        let base = self.num_experts / self.world_size;
        let extra = self.num_experts % self.world_size;
        let wide = extra * (base + 1);
        Some(if global_id < wide {
            global_id / (base + 1)
        } else {
            extra + (global_id - wide) / base
        })
    }
}
