//! Named load destinations.
//!
//! A [`Parameter`] is a preallocated tensor cell plus the rule for writing a
//! checkpoint tensor into it: whole-tensor replacement, a slice of a stacked
//! projection selected by [`ShardId`], or one expert's slice of a per-expert
//! stacked weight. Cells are written sequentially at load time and only read
//! afterwards.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use candle_core::{DType, Device, Shape, Tensor};

use crate::error::{Error, Result};

/// Which slice of a stacked destination a checkpoint tensor fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardId {
    Q,
    K,
    V,
    /// Positional shard (gate = 0, up = 1).
    Index(usize),
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Q => write!(f, "q"),
            Self::K => write!(f, "k"),
            Self::V => write!(f, "v"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Placement of one shard inside a stacked dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSlot {
    pub id: ShardId,
    pub offset: usize,
    pub len: usize,
}

impl ShardSlot {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Lay shards out back to back in declaration order.
pub fn stack_slots(shards: &[(ShardId, usize)]) -> Vec<ShardSlot> {
    let mut offset = 0;
    shards
        .iter()
        .map(|&(id, len)| {
            let slot = ShardSlot { id, offset, len };
            offset += len;
            slot
        })
        .collect()
}

/// Slice taken from the incoming tensor before it is written, used when a
/// rank keeps only its tensor-parallel part of a full checkpoint tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceNarrow {
    pub dim: usize,
    pub start: usize,
    pub len: usize,
}

/// How a checkpoint tensor maps onto the destination cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamLayout {
    /// The checkpoint tensor replaces the cell; shapes must match exactly.
    Whole,
    /// Shards are stacked along `dim`.
    Stacked { dim: usize, slots: Vec<ShardSlot> },
    /// Dimension 0 indexes experts. Shards, if any, are stacked along
    /// dimension 1 of each expert's slice.
    Experts {
        slots: Vec<ShardSlot>,
        narrow: Option<SourceNarrow>,
    },
}

/// Loader contract every destination implements.
pub trait ParameterLoader: Send + Sync {
    /// Write `loaded` into this destination.
    fn load(&self, loaded: &Tensor, shard: Option<ShardId>, expert_id: Option<usize>)
        -> Result<()>;

    /// Whether every distinct slot of this destination has been written.
    fn is_loaded(&self) -> bool;
}

/// Identifies one writable slot: expert index and shard id, either absent
/// when the layout has no such axis.
type SlotKey = (Option<usize>, Option<ShardId>);

/// A tensor cell with a load layout.
pub struct Parameter {
    data: RwLock<Tensor>,
    layout: ParamLayout,
    written: Mutex<HashSet<SlotKey>>,
    expected_slots: usize,
}

impl Parameter {
    /// Allocate a zero-filled destination.
    pub fn zeros<S: Into<Shape>>(
        shape: S,
        dtype: DType,
        device: &Device,
        layout: ParamLayout,
    ) -> Result<Self> {
        let data = Tensor::zeros(shape, dtype, device)?;
        let expected_slots = match &layout {
            ParamLayout::Whole => 1,
            ParamLayout::Stacked { slots, .. } => slots.len(),
            ParamLayout::Experts { slots, .. } => data.dim(0)? * slots.len().max(1),
        };
        Ok(Self {
            data: RwLock::new(data),
            layout,
            written: Mutex::new(HashSet::new()),
            expected_slots,
        })
    }

    /// Zero-filled whole-tensor destination, wrapped for sharing.
    pub fn whole<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::zeros(shape, dtype, device, ParamLayout::Whole)?))
    }

    /// Current contents. Cheap: tensors share storage.
    pub fn tensor(&self) -> Tensor {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn dims(&self) -> Vec<usize> {
        self.tensor().dims().to_vec()
    }

    /// Number of distinct slots written so far.
    pub fn written_slots(&self) -> usize {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("dims", &self.dims())
            .field("layout", &self.layout)
            .field("written", &self.written_slots())
            .field("expected", &self.expected_slots)
            .finish()
    }
}

fn full_ranges(dims: &[usize]) -> Vec<Range<usize>> {
    dims.iter().map(|&d| 0..d).collect()
}

fn find_slot(slots: &[ShardSlot], shard: ShardId) -> Result<ShardSlot> {
    slots
        .iter()
        .copied()
        .find(|s| s.id == shard)
        .ok_or_else(|| Error::load(format!("no slot for shard '{shard}'")))
}

fn check_dims(expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(Error::shape(format!(
            "expected checkpoint tensor of shape {expected:?}, got {actual:?}"
        )));
    }
    Ok(())
}

impl ParameterLoader for Parameter {
    fn load(
        &self,
        loaded: &Tensor,
        shard: Option<ShardId>,
        expert_id: Option<usize>,
    ) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let dest_dims = data.dims().to_vec();
        let loaded = loaded.to_dtype(data.dtype())?.to_device(data.device())?;

        let updated = match &self.layout {
            ParamLayout::Whole => {
                if let Some(shard) = shard {
                    return Err(Error::load(format!(
                        "whole-tensor destination got shard '{shard}'"
                    )));
                }
                if let Some(expert_id) = expert_id {
                    return Err(Error::load(format!(
                        "whole-tensor destination got expert {expert_id}"
                    )));
                }
                check_dims(&dest_dims, loaded.dims())?;
                loaded
            }
            ParamLayout::Stacked { dim, slots } => {
                let shard = shard
                    .ok_or_else(|| Error::load("stacked destination requires a shard id"))?;
                let slot = find_slot(slots, shard)?;
                let mut expected = dest_dims.clone();
                expected[*dim] = slot.len;
                check_dims(&expected, loaded.dims())?;

                let mut ranges = full_ranges(&dest_dims);
                ranges[*dim] = slot.range();
                data.slice_assign(&ranges, &loaded.contiguous()?)?
            }
            ParamLayout::Experts { slots, narrow } => {
                let expert_id = expert_id
                    .ok_or_else(|| Error::load("per-expert destination requires an expert id"))?;
                if expert_id >= dest_dims[0] {
                    return Err(Error::load(format!(
                        "expert {expert_id} out of range for {} experts",
                        dest_dims[0]
                    )));
                }
                let rows = match (shard, slots.is_empty()) {
                    (Some(shard), false) => find_slot(slots, shard)?.range(),
                    (None, true) => 0..dest_dims[1],
                    (Some(shard), true) => {
                        return Err(Error::load(format!(
                            "unsharded per-expert destination got shard '{shard}'"
                        )))
                    }
                    (None, false) => {
                        return Err(Error::load(
                            "sharded per-expert destination requires a shard id",
                        ))
                    }
                };

                let source = match narrow {
                    Some(n) => {
                        let available = loaded.dim(n.dim)?;
                        if n.start + n.len > available {
                            return Err(Error::shape(format!(
                                "cannot take [{}, {}) of dimension {} with size {available}",
                                n.start,
                                n.start + n.len,
                                n.dim
                            )));
                        }
                        loaded.narrow(n.dim, n.start, n.len)?
                    }
                    None => loaded,
                };

                let mut expected = vec![rows.len()];
                expected.extend_from_slice(&dest_dims[2..]);
                check_dims(&expected, source.dims())?;

                let mut ranges = full_ranges(&dest_dims);
                ranges[0] = expert_id..expert_id + 1;
                ranges[1] = rows;
                data.slice_assign(&ranges, &source.contiguous()?.unsqueeze(0)?)?
            }
        };

        *data = updated;
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((expert_id, shard));
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.written_slots() >= self.expected_slots
    }
}

/// Stacked destination whose shards live in separate cells.
///
/// Used when the backend cannot pack shards into one store, so each shard id
/// is routed to its own sub-parameter.
pub struct ShardedParameter {
    parts: Vec<(ShardId, Arc<Parameter>)>,
}

impl ShardedParameter {
    pub fn new(parts: Vec<(ShardId, Arc<Parameter>)>) -> Self {
        Self { parts }
    }

    pub fn part(&self, shard: ShardId) -> Option<&Arc<Parameter>> {
        self.parts.iter().find(|(id, _)| *id == shard).map(|(_, p)| p)
    }
}

impl ParameterLoader for ShardedParameter {
    fn load(
        &self,
        loaded: &Tensor,
        shard: Option<ShardId>,
        expert_id: Option<usize>,
    ) -> Result<()> {
        let shard =
            shard.ok_or_else(|| Error::load("sharded destination requires a shard id"))?;
        let part = self
            .part(shard)
            .ok_or_else(|| Error::load(format!("no part for shard '{shard}'")))?;
        part.load(loaded, None, expert_id)
    }

    fn is_loaded(&self) -> bool {
        self.parts.iter().all(|(_, p)| p.is_loaded())
    }
}
