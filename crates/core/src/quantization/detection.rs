//! Quantization method detection from HuggingFace model configs.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::config::QuantizationMethod;
use crate::error::{Error, Result};

/// Detected quantization configuration from model files.
#[derive(Debug, Clone, Default)]
pub struct DetectedQuantConfig {
    pub method: QuantizationMethod,
    pub codebook: Option<String>,
    pub raw_config: HashMap<String, Value>,
}

impl DetectedQuantConfig {
    /// The raw section as a JSON object, for backend parsers.
    pub fn raw_json(&self) -> Value {
        Value::Object(self.raw_config.clone().into_iter().collect())
    }
}

/// HuggingFace quantization config in config.json.
#[derive(Debug, Deserialize)]
struct HfQuantizationConfig {
    quant_method: Option<String>,
    codebook: Option<String>,
}

/// Detect quantization from a parsed config.json.
///
/// A missing `quantization_config` section means full precision; a method
/// this crate has no backend for is a configuration error.
pub fn detect_from_json(config: &Value) -> Result<DetectedQuantConfig> {
    let Some(section) = config.get("quantization_config") else {
        return Ok(DetectedQuantConfig::default());
    };

    let hf: HfQuantizationConfig = serde_json::from_value(section.clone())
        .map_err(|e| Error::config(format!("malformed quantization_config: {e}")))?;
    let method = QuantizationMethod::from_name(hf.quant_method.as_deref().unwrap_or(""))?;
    let raw_config = section
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Ok(DetectedQuantConfig {
        method,
        codebook: hf.codebook,
        raw_config,
    })
}
