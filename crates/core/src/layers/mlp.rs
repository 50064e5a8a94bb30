//! Gated feed-forward block used for dense layers and individual experts.

use candle_core::{Device, Tensor, D};

use crate::error::{Error, Result};
use crate::loader::{join_name, ParameterRegistry, ShardId};
use crate::quantization::QuantizationConfig;

use super::linear::{MergedColumnLinear, ReplicatedLinear};

/// Only activation the gated MLPs implement.
pub const SUPPORTED_ACTIVATION: &str = "silu";

pub(crate) fn check_activation(hidden_act: &str) -> Result<()> {
    if hidden_act != SUPPORTED_ACTIVATION {
        return Err(Error::config(format!(
            "unsupported activation '{hidden_act}', only {SUPPORTED_ACTIVATION} is supported"
        )));
    }
    Ok(())
}

/// `silu(x[..., :d]) * x[..., d:]` for a last dimension of `2d`.
pub fn silu_and_mul(xs: &Tensor) -> Result<Tensor> {
    let width = xs.dim(D::Minus1)?;
    if width % 2 != 0 {
        return Err(Error::shape(format!("gated activation over odd width {width}")));
    }
    let half = width / 2;
    let gate = candle_nn::ops::silu(&xs.narrow(D::Minus1, 0, half)?)?;
    let up = xs.narrow(D::Minus1, half, half)?;
    Ok((gate * up)?)
}

/// SwiGLU MLP with gate and up projections packed into `gate_up_proj`.
pub struct GatedMlp {
    gate_up_proj: MergedColumnLinear,
    down_proj: ReplicatedLinear,
}

impl GatedMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        hidden_act: &str,
        quant: &dyn QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        check_activation(hidden_act)?;
        let gate_up_proj = MergedColumnLinear::new(
            hidden_size,
            &[
                (ShardId::Index(0), intermediate_size),
                (ShardId::Index(1), intermediate_size),
            ],
            false,
            quant,
            device,
        )?;
        let down_proj = ReplicatedLinear::new(intermediate_size, hidden_size, false, quant, device)?;
        Ok(Self {
            gate_up_proj,
            down_proj,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(xs)?;
        self.down_proj.forward(&silu_and_mul(&gate_up)?)
    }

    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        self.gate_up_proj
            .register_parameters(&join_name(prefix, "gate_up_proj"), registry)?;
        self.down_proj
            .register_parameters(&join_name(prefix, "down_proj"), registry)
    }
}
