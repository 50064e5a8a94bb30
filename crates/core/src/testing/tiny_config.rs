use crate::config::ModelConfig;

/// Tiny Qwen2-MoE-like config: 2 layers, 64 hidden, 4 experts, top-2,
/// with a shared expert. Uses < 1MB of parameters.
pub fn tiny_moe_config() -> ModelConfig {
    let mut extra = serde_json::Map::new();
    extra.insert("num_experts".into(), 4.into());
    extra.insert("num_experts_per_tok".into(), 2.into());
    extra.insert("moe_intermediate_size".into(), 48.into());
    extra.insert("shared_expert_intermediate_size".into(), 64.into());
    extra.insert("norm_topk_prob".into(), false.into());
    extra.insert("decoder_sparse_step".into(), 1.into());
    ModelConfig {
        hidden_size: 64,
        num_hidden_layers: 2,
        intermediate_size: 128,
        hidden_act: "silu".to_string(),
        extra,
    }
}

/// Tiny dense config: every layer uses a plain gated MLP.
pub fn tiny_dense_config() -> ModelConfig {
    ModelConfig {
        hidden_size: 64,
        num_hidden_layers: 2,
        intermediate_size: 128,
        hidden_act: "silu".to_string(),
        extra: serde_json::Map::new(),
    }
}
