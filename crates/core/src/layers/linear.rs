//! Linear layers built through a quantization backend.
//!
//! Both layers own their backend-specific [`QuantizedLinear`]s and publish
//! their load destinations into a [`ParameterRegistry`] under checkpoint
//! names.

use std::sync::Arc;

use candle_core::{Device, Tensor, D};

use crate::error::{Error, Result};
use crate::loader::{join_name, ParameterRegistry, ShardId, ShardedParameter};
use crate::quantization::{LinearShape, QuantizationConfig, QuantizedLinear};

fn register_linear(
    linear: &dyn QuantizedLinear,
    prefix: &str,
    registry: &mut ParameterRegistry,
) -> Result<()> {
    for (name, param) in linear.parameters() {
        registry.register(join_name(prefix, name), param)?;
    }
    Ok(())
}

/// Full, unsharded linear layer present on every rank.
pub struct ReplicatedLinear {
    inner: Box<dyn QuantizedLinear>,
}

impl ReplicatedLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        quant: &dyn QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        let inner = quant.create_linear(
            &LinearShape::replicated(in_features, out_features, bias),
            device,
        )?;
        Ok(Self { inner })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner.forward(xs)
    }

    pub fn in_features(&self) -> usize {
        self.inner.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.inner.out_features()
    }

    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        register_linear(self.inner.as_ref(), prefix, registry)
    }
}

enum Projections {
    /// One store holding every shard, written slice by slice.
    Merged(Box<dyn QuantizedLinear>),
    /// One store per shard, outputs concatenated.
    Split(Vec<(ShardId, Box<dyn QuantizedLinear>)>),
}

/// Several projections of the same input, exposed as one layer whose output
/// is the concatenation of the shards in declaration order.
///
/// Whether the shards share a store is the backend's call
/// ([`QuantizationConfig::merge_weight`]). Either way the checkpoint loader
/// sees one destination per parameter name, addressed by shard id.
pub struct MergedColumnLinear {
    projections: Projections,
    in_features: usize,
    out_features: usize,
}

impl MergedColumnLinear {
    pub fn new(
        in_features: usize,
        shards: &[(ShardId, usize)],
        bias: bool,
        quant: &dyn QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::config("merged linear needs at least one shard"));
        }
        let projections = if quant.merge_weight() {
            Projections::Merged(
                quant.create_linear(&LinearShape::stacked(in_features, shards, bias), device)?,
            )
        } else {
            Projections::Split(
                shards
                    .iter()
                    .map(|&(id, size)| {
                        let shape = LinearShape::replicated(in_features, size, bias);
                        Ok((id, quant.create_linear(&shape, device)?))
                    })
                    .collect::<Result<_>>()?,
            )
        };
        Ok(Self {
            projections,
            in_features,
            out_features: shards.iter().map(|(_, n)| n).sum(),
        })
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.projections, Projections::Merged(_))
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.projections {
            Projections::Merged(linear) => linear.forward(xs),
            Projections::Split(parts) => {
                let outs = parts
                    .iter()
                    .map(|(_, linear)| linear.forward(xs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Tensor::cat(&outs, D::Minus1)?)
            }
        }
    }

    pub fn register_parameters(&self, prefix: &str, registry: &mut ParameterRegistry) -> Result<()> {
        match &self.projections {
            Projections::Merged(linear) => register_linear(linear.as_ref(), prefix, registry),
            Projections::Split(parts) => {
                // Every part is built by the same backend, so parameter names
                // line up across parts.
                let Some((_, first)) = parts.first() else {
                    return Ok(());
                };
                let per_part: Vec<_> = parts
                    .iter()
                    .map(|(id, linear)| (*id, linear.parameters()))
                    .collect();
                for (index, (name, _)) in first.parameters().into_iter().enumerate() {
                    let routed = per_part
                        .iter()
                        .map(|(id, params)| (*id, Arc::clone(&params[index].1)))
                        .collect();
                    registry.register(
                        join_name(prefix, name),
                        Arc::new(ShardedParameter::new(routed)),
                    )?;
                }
                Ok(())
            }
        }
    }
}
