//! Quantization backends for linear layers and experts.
//!
//! # Architecture
//!
//! The quantization system uses a trait-based design:
//!
//! - `QuantizationConfig`: capability interface of each backend
//! - `QuantizedLinear`: forward contract of a layer built by a backend
//! - Detection utilities for HuggingFace model configs
//!
//! # Example
//!
//! ```ignore
//! use qmoe_core::quantization::{create_config, detect_from_json, LinearShape};
//!
//! let detected = detect_from_json(&config_json)?;
//! let config = create_config(&detected, DType::F16)?;
//! let linear = config.create_linear(&LinearShape::replicated(2048, 1408, false), &device)?;
//! ```

mod config;
mod detection;
pub mod quip;

pub use config::{
    LinearShape, NoQuantizationConfig, QuantizationConfig, QuantizationMethod, QuantizedLinear,
    UnquantizedLinear,
};
pub use detection::{detect_from_json, DetectedQuantConfig};
pub use quip::QuipConfig;

use candle_core::DType;

use crate::error::Result;

/// Create a quantization config from detected configuration.
///
/// `dtype` is the activation dtype; unquantized weights and QuIP# scale
/// vectors are allocated in it.
pub fn create_config(detected: &DetectedQuantConfig, dtype: DType) -> Result<Box<dyn QuantizationConfig>> {
    match detected.method {
        QuantizationMethod::None => Ok(Box::new(NoQuantizationConfig::new(dtype))),
        QuantizationMethod::Quip => Ok(Box::new(QuipConfig::from_json(&detected.raw_json(), dtype)?)),
    }
}
