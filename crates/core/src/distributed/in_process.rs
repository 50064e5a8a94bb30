//! In-process communicator group.
//!
//! Each rank runs on its own thread and exchanges tensors through shared
//! memory guarded by a reusable barrier. It implements the same blocking
//! semantics as a device transport: a rank entering `all_reduce` does not
//! return until all peers have entered it too.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::Tensor;

use super::communicator::{reduce_tensors, DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

struct GroupState {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// One rank's handle on an in-process group.
pub struct InProcessCommunicator {
    group: LocalProcessGroup,
    state: Arc<GroupState>,
}

/// Create a group of `world_size` connected communicators, one per rank.
///
/// Handle `i` belongs to rank `i`; each must be moved to its own thread.
pub fn in_process_group(world_size: usize) -> Result<Vec<InProcessCommunicator>> {
    if world_size == 0 {
        return Err(DistributedError::InvalidRank {
            rank: 0,
            world_size,
        });
    }
    let state = Arc::new(GroupState {
        slots: Mutex::new(vec![None; world_size]),
        barrier: Barrier::new(world_size),
    });
    (0..world_size)
        .map(|rank| {
            Ok(InProcessCommunicator {
                group: LocalProcessGroup::with_rank(rank, world_size)?,
                state: Arc::clone(&state),
            })
        })
        .collect()
}

fn poisoned(op: &'static str) -> DistributedError {
    DistributedError::CollectiveFailed {
        op,
        reason: "group state poisoned by a panicked rank".to_string(),
    }
}

impl DeviceCommunicator for InProcessCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.group.is_single() {
            return Ok(tensor.clone());
        }

        {
            let mut slots = self.state.slots.lock().map_err(|_| poisoned("all_reduce"))?;
            slots[self.group.rank()] = Some(tensor.clone());
        }
        self.state.barrier.wait();

        let gathered: Vec<Option<Tensor>> = {
            let slots = self.state.slots.lock().map_err(|_| poisoned("all_reduce"))?;
            slots.clone()
        };
        // Nobody may overwrite a slot before every rank has read this round.
        self.state.barrier.wait();

        let parts = gathered
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.ok_or_else(|| DistributedError::CollectiveFailed {
                    op: "all_reduce",
                    reason: format!("rank {rank} did not contribute"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        reduce_tensors(&parts, op)
    }

    fn barrier(&self) -> Result<()> {
        self.state.barrier.wait();
        Ok(())
    }
}
