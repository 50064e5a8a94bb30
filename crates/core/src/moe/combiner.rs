//! Per-expert weighted combination.
//!
//! For each locally owned expert `e`:
//!
//! ```text
//! weight[n] = Σ_k topk_weights[n, k] · [topk_ids[n, k] == e]
//! out      += weight[:, None] · expert_e(x)
//! ```
//!
//! Every expert runs over the whole batch; tokens not routed to it get a zero
//! weight. A token that lists the same expert twice gets both weights.

use candle_core::{DType, Tensor};
use tracing::trace;

use crate::error::{Error, Result};

use super::expert::ExpertFeedForward;
use super::router::RoutingDecision;

/// `[N, 1]` F32 weight of `expert_id` for every token.
pub fn expert_token_weights(routing: &RoutingDecision, expert_id: usize) -> Result<Tensor> {
    let ids = &routing.topk_ids;
    let target = Tensor::full(expert_id as u32, ids.dims(), ids.device())?;
    let mask = ids.eq(&target)?.to_dtype(DType::F32)?;
    let weights = routing.topk_weights.to_dtype(DType::F32)?;
    Ok((weights * mask)?.sum_keepdim(1)?)
}

/// Accumulate `weight_e · expert_e(hidden)` over the given experts.
///
/// `hidden` is `[N, H]`; the result has the same shape and dtype. Returns
/// zeros when `experts` is empty.
pub fn combine_dense<'a, I>(hidden: &Tensor, routing: &RoutingDecision, experts: I) -> Result<Tensor>
where
    I: IntoIterator<Item = (usize, &'a dyn ExpertFeedForward)>,
{
    let (num_tokens, _) = hidden.dims2()?;
    if routing.num_tokens() != num_tokens {
        return Err(Error::shape(format!(
            "routing covers {} tokens, hidden states have {num_tokens}",
            routing.num_tokens()
        )));
    }

    let mut output = hidden.zeros_like()?.to_dtype(DType::F32)?;
    for (expert_id, expert) in experts {
        let weights = expert_token_weights(routing, expert_id)?;
        let out = expert.forward(hidden)?.to_dtype(DType::F32)?;
        trace!(expert_id, "combining expert output");
        output = (output + out.broadcast_mul(&weights)?)?;
    }
    Ok(output.to_dtype(hidden.dtype())?)
}
