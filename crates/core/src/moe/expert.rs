//! Per-expert feed-forward networks.

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::layers::mlp::check_activation;
use crate::layers::ReplicatedLinear;
use crate::loader::{join_name, ParameterRegistry};
use crate::quantization::QuantizationConfig;

/// Anything the combiner can weight and accumulate: `[N, H] -> [N, H]`.
pub trait ExpertFeedForward: Send + Sync {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;
}

/// A single MoE expert (FFN layer).
///
/// Uses SwiGLU activation: output = down_proj(silu(gate_proj(x)) * up_proj(x)).
/// The three projections are separate layers because checkpoints store them
/// per expert under their own names.
pub struct ExpertMlp {
    gate_proj: ReplicatedLinear,
    up_proj: ReplicatedLinear,
    down_proj: ReplicatedLinear,
}

impl ExpertMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        hidden_act: &str,
        quant: &dyn QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        check_activation(hidden_act)?;
        Ok(Self {
            gate_proj: ReplicatedLinear::new(hidden_size, intermediate_size, false, quant, device)?,
            up_proj: ReplicatedLinear::new(hidden_size, intermediate_size, false, quant, device)?,
            down_proj: ReplicatedLinear::new(intermediate_size, hidden_size, false, quant, device)?,
        })
    }

    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        self.gate_proj
            .register_parameters(&join_name(prefix, "gate_proj"), registry)?;
        self.up_proj
            .register_parameters(&join_name(prefix, "up_proj"), registry)?;
        self.down_proj
            .register_parameters(&join_name(prefix, "down_proj"), registry)
    }
}

impl ExpertFeedForward for ExpertMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}
