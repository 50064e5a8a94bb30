//! Device communicator for collective operations.
//!
//! The MoE block needs exactly one collective: a blocking all-reduce over the
//! combined output. Every rank of the group must issue the same sequence of
//! collectives on every step; a rank that skips one leaves its peers blocked.
//! That is an upstream scheduling invariant and is not re-validated here.

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

/// Trait for rank-to-rank communication.
///
/// Implementations can wrap a real transport or be no-ops for a single rank.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// Blocks until every rank of the group has contributed.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;

    fn rank(&self) -> usize {
        self.process_group().rank()
    }

    fn world_size(&self) -> usize {
        self.process_group().world_size()
    }
}

/// Communicator for single-rank execution.
///
/// Collectives are identity operations since there is nobody to talk to.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    /// Create a new mock communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Reduce a rank-ordered list of contributions.
///
/// Contributions are folded in rank order so every rank computes a
/// bit-identical result.
pub(crate) fn reduce_tensors(parts: &[Tensor], op: ReduceOp) -> Result<Tensor> {
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| DistributedError::CollectiveFailed {
            op: "all_reduce",
            reason: "no contributions".to_string(),
        })?;

    let mut acc = first.clone();
    for part in rest {
        if part.dims() != first.dims() {
            return Err(DistributedError::ShapeMismatch {
                expected: first.dims().to_vec(),
                actual: part.dims().to_vec(),
            });
        }
        acc = match op {
            ReduceOp::Sum | ReduceOp::Average => (acc + part)?,
            ReduceOp::Min => acc.minimum(part)?,
            ReduceOp::Max => acc.maximum(part)?,
        };
    }

    if op == ReduceOp::Average {
        acc = acc.affine(1.0 / parts.len() as f64, 0.0)?;
    }
    Ok(acc)
}
