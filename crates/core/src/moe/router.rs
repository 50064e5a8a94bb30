//! MoE Router implementation.
//!
//! Routes tokens to experts using top-k selection over a full softmax. The
//! gate is always full precision, whatever backend the experts use.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::layers::ReplicatedLinear;
use crate::loader::ParameterRegistry;
use crate::quantization::NoQuantizationConfig;

use super::topk::{topk_softmax, TopKNormalization};

/// Configuration for the MoE router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Hidden size of input tokens.
    pub hidden_size: usize,
    /// Number of experts.
    pub num_experts: usize,
    /// Number of experts to route each token to.
    pub top_k: usize,
    pub normalization: TopKNormalization,
}

/// Per-step routing of a token batch.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// `[num_tokens, num_experts]` raw gate output.
    pub router_logits: Tensor,
    /// `[num_tokens, top_k]` F32, descending per row.
    pub topk_weights: Tensor,
    /// `[num_tokens, top_k]` U32, distinct per row.
    pub topk_ids: Tensor,
}

impl RoutingDecision {
    pub fn from_logits(
        router_logits: Tensor,
        top_k: usize,
        normalization: TopKNormalization,
    ) -> Result<Self> {
        let (topk_weights, topk_ids) = topk_softmax(&router_logits, top_k, normalization)?;
        Ok(Self {
            router_logits,
            topk_weights,
            topk_ids,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.topk_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn top_k(&self) -> usize {
        self.topk_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Trait for MoE routers.
pub trait MoERouter: Send + Sync {
    /// Route `[num_tokens, hidden_size]` hidden states to experts.
    fn route(&self, hidden_states: &Tensor) -> Result<RoutingDecision>;

    fn num_experts(&self) -> usize;

    fn top_k(&self) -> usize;
}

/// Top-K router with softmax normalization.
///
/// Routes each token to the top-k experts based on a learned gating function.
pub struct TopKRouter {
    gate: ReplicatedLinear,
    config: RouterConfig,
}

impl TopKRouter {
    pub fn new(config: RouterConfig, dtype: DType, device: &Device) -> Result<Self> {
        if config.top_k == 0 || config.top_k > config.num_experts {
            return Err(Error::config(format!(
                "top_k ({}) must be in 1..={}",
                config.top_k, config.num_experts
            )));
        }
        let gate = ReplicatedLinear::new(
            config.hidden_size,
            config.num_experts,
            false,
            &NoQuantizationConfig::new(dtype),
            device,
        )?;
        Ok(Self { gate, config })
    }

    /// Get the router logits (before softmax).
    pub fn router_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.gate.forward(hidden_states)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        self.gate.register_parameters(prefix, registry)
    }
}

impl MoERouter for TopKRouter {
    fn route(&self, hidden_states: &Tensor) -> Result<RoutingDecision> {
        let router_logits = self.router_logits(hidden_states)?;
        RoutingDecision::from_logits(router_logits, self.config.top_k, self.config.normalization)
    }

    fn num_experts(&self) -> usize {
        self.config.num_experts
    }

    fn top_k(&self) -> usize {
        self.config.top_k
    }
}
