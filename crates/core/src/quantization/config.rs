//! Core quantization configuration and traits.
//!
//! This module provides the base traits and types for quantization:
//! - `QuantizationConfig` - backend capability interface
//! - `QuantizedLinear` - forward contract of a linear layer built by a backend
//! - `QuantizationMethod` - enum of supported quantization methods
//! - `LinearShape` - full and per-partition geometry of a linear layer

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loader::{stack_slots, ParamLayout, Parameter, ShardId};
use crate::moe::fused::{fused_moe_forward, FusedMoeWeights};
use crate::moe::TopKNormalization;

/// Supported quantization methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMethod {
    /// No quantization (full precision)
    #[default]
    None,
    /// QuIP# incoherence-processed lattice codebook quantization
    Quip,
}

impl QuantizationMethod {
    /// Parse the `quant_method` field of a quantization config.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "quip" | "quip#" => Ok(Self::Quip),
            other => Err(Error::config(format!(
                "unsupported quantization method '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for QuantizationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Quip => write!(f, "quip"),
        }
    }
}

/// Geometry of a linear layer.
///
/// `output_shards` is non-empty when several checkpoint projections are
/// packed into one layer (q/k/v, gate/up), listed in packing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearShape {
    pub input_size: usize,
    pub output_size: usize,
    pub input_size_per_partition: usize,
    pub output_size_per_partition: usize,
    pub bias: bool,
    pub output_shards: Vec<(ShardId, usize)>,
}

impl LinearShape {
    pub fn replicated(input_size: usize, output_size: usize, bias: bool) -> Self {
        Self {
            input_size,
            output_size,
            input_size_per_partition: input_size,
            output_size_per_partition: output_size,
            bias,
            output_shards: Vec::new(),
        }
    }

    pub fn stacked(input_size: usize, shards: &[(ShardId, usize)], bias: bool) -> Self {
        let output_size = shards.iter().map(|(_, n)| n).sum();
        Self {
            output_shards: shards.to_vec(),
            ..Self::replicated(input_size, output_size, bias)
        }
    }

    /// Override the per-partition sizes of a tensor-parallel layer.
    pub fn with_partition(mut self, input_per_partition: usize, output_per_partition: usize) -> Self {
        self.input_size_per_partition = input_per_partition;
        self.output_size_per_partition = output_per_partition;
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.input_size_per_partition != self.input_size
            || self.output_size_per_partition != self.output_size
    }
}

/// Base trait for quantization configurations.
///
/// This is the capability interface the MoE block and the linear layers
/// consult: whether stacked projections may be packed into one store, and
/// whether expert weights can run through a fused MoE kernel.
pub trait QuantizationConfig: Send + Sync + std::fmt::Debug {
    /// Returns the quantization method name.
    fn method(&self) -> QuantizationMethod;

    /// Returns supported activation dtypes.
    fn supported_act_dtypes(&self) -> &[DType];

    /// Returns minimum GPU compute capability required.
    /// E.g., 70 for Volta, 75 for Turing, 80 for Ampere.
    fn min_capability(&self) -> u32;

    /// Whether stacked projections share one packed store.
    fn merge_weight(&self) -> bool {
        true
    }

    /// Create a linear layer for the given geometry.
    fn create_linear(&self, shape: &LinearShape, device: &Device)
        -> Result<Box<dyn QuantizedLinear>>;

    /// Whether `apply_fused_moe` is implemented.
    fn supports_fused_moe(&self) -> bool {
        false
    }

    /// Run all experts over all tokens in one call.
    ///
    /// `weights.w13` is `[E, 2 * I, H]` (gate rows then up rows), `weights.w2`
    /// is `[E, H, I]`. Returns `[N, H]`.
    fn apply_fused_moe(
        &self,
        _weights: &FusedMoeWeights,
        _hidden: &Tensor,
        _router_logits: &Tensor,
        _top_k: usize,
        _normalization: TopKNormalization,
    ) -> Result<Tensor> {
        Err(Error::config(format!(
            "{} backend has no fused MoE kernel",
            self.method()
        )))
    }

    /// Clone the configuration into a boxed trait object.
    fn clone_box(&self) -> Box<dyn QuantizationConfig>;
}

impl Clone for Box<dyn QuantizationConfig> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Trait for quantized linear layer operations.
///
/// This trait defines the interface for quantized linear layers.
/// Different quantization methods implement this trait differently.
pub trait QuantizedLinear: Send + Sync {
    /// Forward pass through the linear layer. Accepts any number of leading
    /// dimensions.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Load destinations, keyed by local name (`weight`, `Qidxs`, ...).
    fn parameters(&self) -> Vec<(&'static str, Arc<Parameter>)>;

    /// Get input features.
    fn in_features(&self) -> usize;

    /// Get output features.
    fn out_features(&self) -> usize;

    /// Check if bias is present.
    fn has_bias(&self) -> bool;
}

/// No quantization (full precision) configuration.
#[derive(Debug, Clone)]
pub struct NoQuantizationConfig {
    dtype: DType,
}

impl NoQuantizationConfig {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }
}

impl Default for NoQuantizationConfig {
    fn default() -> Self {
        Self { dtype: DType::BF16 }
    }
}

impl QuantizationConfig for NoQuantizationConfig {
    fn method(&self) -> QuantizationMethod {
        QuantizationMethod::None
    }

    fn supported_act_dtypes(&self) -> &[DType] {
        &[DType::F32, DType::F16, DType::BF16]
    }

    fn min_capability(&self) -> u32 {
        0 // No minimum requirement
    }

    fn create_linear(
        &self,
        shape: &LinearShape,
        device: &Device,
    ) -> Result<Box<dyn QuantizedLinear>> {
        Ok(Box::new(UnquantizedLinear::new(shape, self.dtype, device)?))
    }

    fn supports_fused_moe(&self) -> bool {
        true
    }

    fn apply_fused_moe(
        &self,
        weights: &FusedMoeWeights,
        hidden: &Tensor,
        router_logits: &Tensor,
        top_k: usize,
        normalization: TopKNormalization,
    ) -> Result<Tensor> {
        fused_moe_forward(weights, hidden, router_logits, top_k, normalization)
    }

    fn clone_box(&self) -> Box<dyn QuantizationConfig> {
        Box::new(self.clone())
    }
}

/// Unquantized (full precision) linear layer.
#[derive(Debug)]
pub struct UnquantizedLinear {
    weight: Arc<Parameter>,
    bias: Option<Arc<Parameter>>,
    in_features: usize,
    out_features: usize,
}

impl UnquantizedLinear {
    pub fn new(shape: &LinearShape, dtype: DType, device: &Device) -> Result<Self> {
        let in_features = shape.input_size_per_partition;
        let out_features = shape.output_size_per_partition;
        if !shape.output_shards.is_empty() && shape.is_partitioned() {
            return Err(Error::config(
                "stacked projections cannot be partitioned in this layer",
            ));
        }

        // Zeros until the checkpoint is streamed in.
        let layout = |dim| {
            if shape.output_shards.is_empty() {
                ParamLayout::Whole
            } else {
                ParamLayout::Stacked {
                    dim,
                    slots: stack_slots(&shape.output_shards),
                }
            }
        };
        let weight = Arc::new(Parameter::zeros(
            (out_features, in_features),
            dtype,
            device,
            layout(0),
        )?);
        let bias = if shape.bias {
            Some(Arc::new(Parameter::zeros(out_features, dtype, device, layout(0))?))
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn weight(&self) -> Tensor {
        self.weight.tensor()
    }
}

impl QuantizedLinear for UnquantizedLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let linear = candle_nn::Linear::new(
            self.weight.tensor(),
            self.bias.as_ref().map(|b| b.tensor()),
        );
        Ok(linear.forward(x)?)
    }

    fn parameters(&self) -> Vec<(&'static str, Arc<Parameter>)> {
        let mut params = vec![("weight", Arc::clone(&self.weight))];
        if let Some(b) = &self.bias {
            params.push(("bias", Arc::clone(b)));
        }
        params
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }

    fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}
