use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::moe::MoEBlockConfig;

/// HuggingFace `config.json` fields this crate reads.
///
/// MoE fields stay in `extra` and are read through typed accessors, since
/// dense checkpoints omit them.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub hidden_act: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 2048,
            num_hidden_layers: 24,
            intermediate_size: 5632,
            hidden_act: "silu".to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

impl ModelConfig {
    fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn num_experts(&self) -> Option<usize> {
        self.extra_usize("num_experts").filter(|&n| n > 0)
    }

    pub fn num_experts_per_tok(&self) -> Option<usize> {
        self.extra_usize("num_experts_per_tok")
    }

    pub fn moe_intermediate_size(&self) -> Option<usize> {
        self.extra_usize("moe_intermediate_size")
    }

    /// `None` (or 0 in the checkpoint) means no shared expert.
    pub fn shared_expert_intermediate_size(&self) -> Option<usize> {
        self.extra_usize("shared_expert_intermediate_size")
            .filter(|&n| n > 0)
    }

    /// Qwen2-MoE defaults this to `false`.
    pub fn norm_topk_prob(&self) -> bool {
        self.extra
            .get("norm_topk_prob")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn decoder_sparse_step(&self) -> usize {
        self.extra_usize("decoder_sparse_step").unwrap_or(1)
    }

    /// Raw `quantization_config` section, if any.
    pub fn quantization_config(&self) -> Option<&Value> {
        self.extra.get("quantization_config")
    }

    /// Whether layer `layer_idx` uses a sparse MoE block.
    pub fn is_sparse_layer(&self, layer_idx: usize) -> bool {
        let step = self.decoder_sparse_step();
        self.num_experts().is_some() && step > 0 && (layer_idx + 1) % step == 0
    }

    /// Block description for sparse layers.
    pub fn moe_block_config(&self, fused_backend_available: bool) -> Result<MoEBlockConfig> {
        let num_experts = self
            .num_experts()
            .ok_or_else(|| Error::config("model config has no experts"))?;
        let config = MoEBlockConfig {
            num_experts,
            top_k: self
                .num_experts_per_tok()
                .ok_or_else(|| Error::config("model config is missing num_experts_per_tok"))?,
            hidden_size: self.hidden_size,
            expert_intermediate_size: self
                .moe_intermediate_size()
                .unwrap_or(self.intermediate_size),
            shared_expert_intermediate_size: self.shared_expert_intermediate_size(),
            renormalize: self.norm_topk_prob(),
            fused_backend_available,
        };
        config.validate()?;
        Ok(config)
    }
}
