//! Fused expert execution.
//!
//! All experts' weights live in two stacked tensors so a backend can run the
//! whole MoE in one call:
//!
//! - `w13`: `[E, 2 * I, H]`, gate rows then up rows of every expert
//! - `w2`: `[E, H, I]`
//!
//! Across ranks the intermediate dimension is sharded: each rank keeps
//! `I / world_size` gate, up and down columns of every expert, so each rank
//! produces a partial sum and the all-reduce completes it.

use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::distributed::ParallelContext;
use crate::error::{Error, Result};
use crate::layers::silu_and_mul;
use crate::loader::{
    join_name, stack_slots, ParamLayout, Parameter, ParameterRegistry, ShardId, SourceNarrow,
};

use super::topk::{topk_softmax, TopKNormalization};

/// Stacked expert weights handed to a fused backend.
#[derive(Debug, Clone)]
pub struct FusedMoeWeights {
    pub w13: Tensor,
    pub w2: Tensor,
}

impl FusedMoeWeights {
    pub fn num_experts(&self) -> Result<usize> {
        Ok(self.w13.dim(0)?)
    }
}

/// Reference grouped implementation of the fused MoE contract.
///
/// Tokens are grouped by selected expert, each group runs through its
/// expert's SwiGLU as one batch, and weighted results are scattered back
/// with `index_add`.
pub fn fused_moe_forward(
    weights: &FusedMoeWeights,
    hidden: &Tensor,
    router_logits: &Tensor,
    top_k: usize,
    normalization: TopKNormalization,
) -> Result<Tensor> {
    let (num_tokens, hidden_size) = hidden.dims2()?;
    let (num_experts, w13_rows, w13_cols) = weights.w13.dims3()?;
    let (w2_experts, w2_rows, intermediate) = weights.w2.dims3()?;
    if w13_cols != hidden_size
        || w2_rows != hidden_size
        || w2_experts != num_experts
        || w13_rows != 2 * intermediate
    {
        return Err(Error::shape(format!(
            "fused weights w13 {:?} / w2 {:?} inconsistent with hidden size {hidden_size}",
            weights.w13.dims(),
            weights.w2.dims()
        )));
    }

    let (topk_weights, topk_ids) = topk_softmax(router_logits, top_k, normalization)?;
    let ids: Vec<u32> = topk_ids.flatten_all()?.to_vec1()?;
    let probs: Vec<f32> = topk_weights.flatten_all()?.to_vec1()?;

    // Build token groups per expert
    let mut expert_tokens: Vec<Vec<(u32, f32)>> = vec![Vec::new(); num_experts];
    for (flat_idx, (&expert_id, &weight)) in ids.iter().zip(&probs).enumerate() {
        let token_idx = (flat_idx / top_k) as u32;
        let slot = expert_tokens.get_mut(expert_id as usize).ok_or_else(|| {
            Error::shape(format!("routed expert {expert_id} out of range for {num_experts}"))
        })?;
        slot.push((token_idx, weight));
    }

    let device = hidden.device();
    let xs = hidden.to_dtype(DType::F32)?;
    let mut output = Tensor::zeros((num_tokens, hidden_size), DType::F32, device)?;

    for (expert_id, tokens) in expert_tokens.iter().enumerate() {
        if tokens.is_empty() {
            continue;
        }
        let batch = tokens.len();
        let index = Tensor::from_vec(
            tokens.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            batch,
            device,
        )?;
        let gate_weights = Tensor::from_vec(
            tokens.iter().map(|(_, w)| *w).collect::<Vec<_>>(),
            (batch, 1),
            device,
        )?;

        let w13 = weights.w13.i(expert_id)?.to_dtype(DType::F32)?;
        let w2 = weights.w2.i(expert_id)?.to_dtype(DType::F32)?;
        let rows = xs.index_select(&index, 0)?;
        let gate_up = rows.matmul(&w13.t()?)?;
        let out = silu_and_mul(&gate_up)?.matmul(&w2.t()?)?;
        output = output.index_add(&index, &out.broadcast_mul(&gate_weights)?, 0)?;
    }

    Ok(output.to_dtype(hidden.dtype())?)
}

/// Fused expert weights of one MoE block, sharded over the intermediate
/// dimension.
pub struct FusedExperts {
    w13: Arc<Parameter>,
    w2: Arc<Parameter>,
    num_experts: usize,
    intermediate_per_rank: usize,
}

impl FusedExperts {
    pub fn new(
        num_experts: usize,
        hidden_size: usize,
        intermediate_size: usize,
        ctx: &ParallelContext,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let world_size = ctx.world_size();
        if intermediate_size % world_size != 0 {
            return Err(Error::config(format!(
                "expert intermediate size {intermediate_size} not divisible by {world_size} ranks"
            )));
        }
        let per_rank = intermediate_size / world_size;
        let start = ctx.rank() * per_rank;

        let w13 = Parameter::zeros(
            (num_experts, 2 * per_rank, hidden_size),
            dtype,
            device,
            ParamLayout::Experts {
                slots: stack_slots(&[(ShardId::Index(0), per_rank), (ShardId::Index(1), per_rank)]),
                narrow: Some(SourceNarrow {
                    dim: 0,
                    start,
                    len: per_rank,
                }),
            },
        )?;
        let w2 = Parameter::zeros(
            (num_experts, hidden_size, per_rank),
            dtype,
            device,
            ParamLayout::Experts {
                slots: Vec::new(),
                narrow: Some(SourceNarrow {
                    dim: 1,
                    start,
                    len: per_rank,
                }),
            },
        )?;

        Ok(Self {
            w13: Arc::new(w13),
            w2: Arc::new(w2),
            num_experts,
            intermediate_per_rank: per_rank,
        })
    }

    pub fn weights(&self) -> FusedMoeWeights {
        FusedMoeWeights {
            w13: self.w13.tensor(),
            w2: self.w2.tensor(),
        }
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn intermediate_per_rank(&self) -> usize {
        self.intermediate_per_rank
    }

    /// Destinations `w1.weight` (gate + up) and `w2.weight` (down).
    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        registry.register(join_name(prefix, "w1.weight"), self.w13.clone())?;
        registry.register(join_name(prefix, "w2.weight"), self.w2.clone())
    }
}
