//! Sparse mixture-of-experts block.
//!
//! ## Execution Modes
//!
//! - **Local**: the backend has no fused MoE kernel. Experts are split
//!   across ranks with [`ExpertShard`]; each rank runs its own experts over
//!   the batch and the partial outputs are all-reduced.
//! - **Fused**: the backend runs all experts in one call. Every rank holds
//!   every expert, sharded over the intermediate dimension, and the partial
//!   outputs are all-reduced.
//!
//! The shared expert, when present, is replicated on every rank and added
//! after the reduction.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::distributed::ParallelContext;
use crate::error::{Error, Result};
use crate::layers::{GatedMlp, ReplicatedLinear, SUPPORTED_ACTIVATION};
use crate::loader::{join_name, ParameterRegistry};
use crate::quantization::{NoQuantizationConfig, QuantizationConfig};

use super::combiner::combine_dense;
use super::expert::{ExpertFeedForward, ExpertMlp};
use super::fused::FusedExperts;
use super::partition::ExpertShard;
use super::router::{MoERouter, RouterConfig, RoutingDecision, TopKRouter};
use super::topk::TopKNormalization;

/// Immutable description of one MoE block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoEBlockConfig {
    pub num_experts: usize,
    pub top_k: usize,
    pub hidden_size: usize,
    pub expert_intermediate_size: usize,
    /// `None` when the block has no shared expert.
    pub shared_expert_intermediate_size: Option<usize>,
    pub renormalize: bool,
    /// Run experts through the backend's fused kernel when it has one.
    pub fused_backend_available: bool,
}

impl MoEBlockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_experts == 0 {
            return Err(Error::config("MoE block needs at least one expert"));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(Error::config(format!(
                "top_k ({}) must be in 1..={}",
                self.top_k, self.num_experts
            )));
        }
        if self.hidden_size == 0 || self.expert_intermediate_size == 0 {
            return Err(Error::config("MoE block sizes must be positive"));
        }
        if self.shared_expert_intermediate_size == Some(0) {
            return Err(Error::config("shared expert intermediate size must be positive"));
        }
        Ok(())
    }

    pub fn normalization(&self) -> TopKNormalization {
        TopKNormalization::from_renormalize(self.renormalize)
    }
}

enum RoutedExpertsMode {
    Local {
        shard: ExpertShard,
        experts: Vec<ExpertMlp>,
    },
    Fused(FusedExperts),
}

struct SharedExpert {
    mlp: GatedMlp,
    /// `hidden -> 1`, sigmoid gating.
    gate: ReplicatedLinear,
}

impl SharedExpert {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.mlp.forward(xs)?;
        let gate = candle_nn::ops::sigmoid(&self.gate.forward(xs)?)?;
        Ok(out.broadcast_mul(&gate)?)
    }
}

pub struct SparseMoeBlock {
    config: MoEBlockConfig,
    ctx: ParallelContext,
    quant: Arc<dyn QuantizationConfig>,
    router: TopKRouter,
    routed: RoutedExpertsMode,
    shared: Option<SharedExpert>,
}

impl SparseMoeBlock {
    pub fn new(
        config: MoEBlockConfig,
        quant: Arc<dyn QuantizationConfig>,
        ctx: ParallelContext,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let router = TopKRouter::new(
            RouterConfig {
                hidden_size: config.hidden_size,
                num_experts: config.num_experts,
                top_k: config.top_k,
                normalization: config.normalization(),
            },
            dtype,
            device,
        )?;

        let fused = config.fused_backend_available && quant.supports_fused_moe();
        let routed = if fused {
            let experts = FusedExperts::new(
                config.num_experts,
                config.hidden_size,
                config.expert_intermediate_size,
                &ctx,
                dtype,
                device,
            )?;
            info!(
                rank = ctx.rank(),
                world_size = ctx.world_size(),
                intermediate_per_rank = experts.intermediate_per_rank(),
                "sparse MoE block using fused experts"
            );
            RoutedExpertsMode::Fused(experts)
        } else {
            let shard = ExpertShard::from_context(config.num_experts, &ctx)?;
            let experts = shard
                .experts()
                .iter()
                .map(|_| {
                    ExpertMlp::new(
                        config.hidden_size,
                        config.expert_intermediate_size,
                        SUPPORTED_ACTIVATION,
                        quant.as_ref(),
                        device,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            info!(
                rank = ctx.rank(),
                world_size = ctx.world_size(),
                experts = ?shard.experts(),
                "sparse MoE block using per-expert execution"
            );
            RoutedExpertsMode::Local { shard, experts }
        };

        let shared = match config.shared_expert_intermediate_size {
            Some(intermediate) => Some(SharedExpert {
                mlp: GatedMlp::new(
                    config.hidden_size,
                    intermediate,
                    SUPPORTED_ACTIVATION,
                    quant.as_ref(),
                    device,
                )?,
                gate: ReplicatedLinear::new(
                    config.hidden_size,
                    1,
                    false,
                    &NoQuantizationConfig::new(dtype),
                    device,
                )?,
            }),
            None => None,
        };

        Ok(Self {
            config,
            ctx,
            quant,
            router,
            routed,
            shared,
        })
    }

    pub fn config(&self) -> &MoEBlockConfig {
        &self.config
    }

    pub fn uses_fused_experts(&self) -> bool {
        matches!(self.routed, RoutedExpertsMode::Fused(_))
    }

    /// Global ids of the experts this rank runs individually, `None` in
    /// fused mode.
    pub fn local_experts(&self) -> Option<&[usize]> {
        match &self.routed {
            RoutedExpertsMode::Local { shard, .. } => Some(shard.experts()),
            RoutedExpertsMode::Fused(_) => None,
        }
    }

    /// Route `[N, H]` hidden states.
    pub fn route(&self, hidden: &Tensor) -> Result<RoutingDecision> {
        self.router.route(hidden)
    }

    /// Combine expert outputs for an existing routing decision, reduce
    /// across ranks and add the shared expert. `hidden` is `[N, H]`.
    pub fn combine(&self, hidden: &Tensor, routing: &RoutingDecision) -> Result<Tensor> {
        let routed = match &self.routed {
            RoutedExpertsMode::Local { shard, experts } => combine_dense(
                hidden,
                routing,
                shard
                    .experts()
                    .iter()
                    .copied()
                    .zip(experts.iter().map(|e| e as &dyn ExpertFeedForward)),
            )?,
            RoutedExpertsMode::Fused(experts) => self.quant.apply_fused_moe(
                &experts.weights(),
                hidden,
                &routing.router_logits,
                self.config.top_k,
                self.config.normalization(),
            )?,
        };

        // Every rank must reach this point each step.
        let reduced = self.ctx.all_reduce_sum(&routed)?;
        debug!(rank = self.ctx.rank(), tokens = hidden.dim(0)?, "MoE output reduced");

        match &self.shared {
            Some(shared) => Ok((reduced + shared.forward(hidden)?)?),
            None => Ok(reduced),
        }
    }

    /// Forward over `[..., H]`; output has the input's shape.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let orig_shape = xs.dims().to_vec();
        let hidden_dim = *orig_shape
            .last()
            .ok_or_else(|| Error::shape("MoE input must have at least one dimension"))?;
        if hidden_dim != self.config.hidden_size {
            return Err(Error::shape(format!(
                "MoE input has {hidden_dim} features, block expects {}",
                self.config.hidden_size
            )));
        }
        let xs_2d = xs.reshape(((), hidden_dim))?;

        let routing = self.route(&xs_2d)?;
        Ok(self.combine(&xs_2d, &routing)?.reshape(orig_shape)?)
    }

    /// Register every destination under `prefix` (e.g. `model.layers.3.mlp`).
    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        self.router
            .register_parameters(&join_name(prefix, "gate"), registry)?;

        match &self.routed {
            RoutedExpertsMode::Local { shard, experts } => {
                for (&expert_id, expert) in shard.experts().iter().zip(experts) {
                    expert.register_parameters(
                        &join_name(prefix, &format!("experts.{expert_id}")),
                        registry,
                    )?;
                }
            }
            RoutedExpertsMode::Fused(experts) => experts.register_parameters(prefix, registry)?,
        }

        if let Some(shared) = &self.shared {
            shared
                .mlp
                .register_parameters(&join_name(prefix, "shared_expert"), registry)?;
            shared
                .gate
                .register_parameters(&join_name(prefix, "shared_expert_gate"), registry)?;
        }
        Ok(())
    }
}
