//! QuIP# quantization (E8P12 codebook with randomized Hadamard incoherence).
//!
//! Checkpoint layout per linear layer:
//! - `Qidxs`: `[padded_out, padded_in / 8]` packed 16-bit codebook indices
//! - `SU`: `[in_features]` input sign/scale vector
//! - `SV`: `[out_features]` output sign/scale vector
//!
//! Stacked projections cannot share one store (the output rotation mixes
//! rows across projections), so this backend reports `merge_weight() ==
//! false` and layers keep one store per projection.
//!
//! Config example (`quantization_config` in config.json):
//! ```json
//! { "quant_method": "quip", "codebook": "E8P12" }
//! ```

mod codebook;
mod hadamard;
mod kernels;
mod linear;
mod store;

use std::sync::Arc;

use candle_core::{DType, Device};

use crate::error::{Error, Result};
use crate::loader::Parameter;

use super::config::{LinearShape, QuantizationConfig, QuantizationMethod, QuantizedLinear};

pub use codebook::{E8P12Codebook, ABS_GRID_SIZE, E8P12_NAME, E8P12_PACK};
pub use hadamard::{
    paley_matrix, select_rotation_block, walsh_hadamard, HadamardRotation, RotationBlock,
    PALEY_BLOCKS,
};
pub use kernels::{codebook_dequantize, codebook_gemv};
pub use linear::{apply, apply_with_strategy, DispatchStrategy, QuipLinear, GEMV_MAX_ROWS};
pub use store::QuipWeightStore;

/// QuIP# backend configuration.
#[derive(Debug, Clone)]
pub struct QuipConfig {
    codebook: Arc<E8P12Codebook>,
    dtype: DType,
}

impl QuipConfig {
    /// Only the E8P12 codebook is supported.
    pub fn new(codebook: &str, dtype: DType) -> Result<Self> {
        if codebook != E8P12_NAME {
            return Err(Error::config(format!(
                "unsupported QuIP# codebook '{codebook}', expected {E8P12_NAME}"
            )));
        }
        Ok(Self {
            codebook: Arc::new(E8P12Codebook::new()),
            dtype,
        })
    }

    /// Parse a `quantization_config` object.
    pub fn from_json(raw: &serde_json::Value, dtype: DType) -> Result<Self> {
        let codebook = raw
            .get("codebook")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::config("QuIP# config is missing 'codebook'"))?;
        Self::new(codebook, dtype)
    }

    pub fn codebook(&self) -> &Arc<E8P12Codebook> {
        &self.codebook
    }
}

impl QuantizationConfig for QuipConfig {
    fn method(&self) -> QuantizationMethod {
        QuantizationMethod::Quip
    }

    fn supported_act_dtypes(&self) -> &[DType] {
        &[DType::F16]
    }

    fn min_capability(&self) -> u32 {
        80
    }

    fn merge_weight(&self) -> bool {
        false
    }

    fn create_linear(
        &self,
        shape: &LinearShape,
        device: &Device,
    ) -> Result<Box<dyn QuantizedLinear>> {
        if shape.is_partitioned() {
            return Err(Error::config(
                "QuIP# does not support tensor-parallel sharding of a linear layer",
            ));
        }
        if !shape.output_shards.is_empty() {
            return Err(Error::config(
                "QuIP# cannot pack stacked projections into one store",
            ));
        }

        let store = QuipWeightStore::new(shape.input_size, shape.output_size, self.dtype, device)?;
        let bias = if shape.bias {
            Some(Parameter::whole(shape.output_size, self.dtype, device)?)
        } else {
            None
        };
        Ok(Box::new(QuipLinear::new(store, bias, Arc::clone(&self.codebook))))
    }

    fn clone_box(&self) -> Box<dyn QuantizationConfig> {
        Box::new(self.clone())
    }
}
