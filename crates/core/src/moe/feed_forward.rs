//! Per-layer feed-forward: dense MLP or sparse MoE block.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::ModelConfig;
use crate::distributed::ParallelContext;
use crate::error::Result;
use crate::layers::GatedMlp;
use crate::loader::ParameterRegistry;
use crate::quantization::QuantizationConfig;

use super::sparse_block::SparseMoeBlock;

/// Feed-forward variant chosen once at construction.
pub enum FeedForward {
    Dense(GatedMlp),
    SparseMoe(Box<SparseMoeBlock>),
}

impl FeedForward {
    /// Build the feed-forward of decoder layer `layer_idx`.
    pub fn for_layer(
        layer_idx: usize,
        cfg: &ModelConfig,
        quant: Arc<dyn QuantizationConfig>,
        ctx: &ParallelContext,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if cfg.is_sparse_layer(layer_idx) {
            debug!(layer_idx, "building sparse MoE feed-forward");
            let block_cfg = cfg.moe_block_config(quant.supports_fused_moe())?;
            crate::layers::mlp::check_activation(&cfg.hidden_act)?;
            let block = SparseMoeBlock::new(block_cfg, quant, ctx.clone(), dtype, device)?;
            Ok(Self::SparseMoe(Box::new(block)))
        } else {
            debug!(layer_idx, "building dense feed-forward");
            let mlp = GatedMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                &cfg.hidden_act,
                quant.as_ref(),
                device,
            )?;
            Ok(Self::Dense(mlp))
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::SparseMoe(_))
    }

    /// Whether checkpoint expert weights must be remapped onto fused stacks.
    pub fn uses_fused_experts(&self) -> bool {
        match self {
            Self::Dense(_) => false,
            Self::SparseMoe(block) => block.uses_fused_experts(),
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(mlp) => mlp.forward(xs),
            Self::SparseMoe(block) => block.forward(xs),
        }
    }

    /// `prefix` is the layer's `mlp` path, e.g. `model.layers.3.mlp`.
    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        match self {
            Self::Dense(mlp) => mlp.register_parameters(prefix, registry),
            Self::SparseMoe(block) => block.register_parameters(prefix, registry),
        }
    }
}
