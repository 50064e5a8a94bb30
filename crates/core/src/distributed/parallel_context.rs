//! Explicit rank context handed to every component constructor.
//!
//! Components never read rank or world size from global state. They receive a
//! [`ParallelContext`] that bundles the rank identity with the communicator of
//! the group the MoE output is reduced over.

use std::sync::Arc;

use candle_core::Tensor;

use super::communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::LocalProcessGroup;

/// Rank identity plus group handle.
///
/// Cloning is cheap (two `usize` copies and one `Arc` clone).
#[derive(Clone)]
pub struct ParallelContext {
    rank: usize,
    world_size: usize,
    comm: Arc<dyn DeviceCommunicator>,
}

impl ParallelContext {
    /// Single-rank context; collectives are identity.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            comm: Arc::new(MockCommunicator::new(LocalProcessGroup::new())),
        }
    }

    /// Context for the rank owning `comm`.
    pub fn new(comm: Arc<dyn DeviceCommunicator>) -> Result<Self> {
        let rank = comm.rank();
        let world_size = comm.world_size();
        if world_size == 0 || rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self {
            rank,
            world_size,
            comm,
        })
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
    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    pub fn comm(&self) -> &dyn DeviceCommunicator {
        self.comm.as_ref()
    }

    /// Blocking sum over the group. Identity for a single rank.
    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.is_single() {
            return Ok(tensor.clone());
        }
        self.comm.all_reduce(tensor, ReduceOp::Sum)
    }
}

impl Default for ParallelContext {
    fn default() -> Self {
        Self::single()
    }
}

impl std::fmt::Debug for ParallelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}
