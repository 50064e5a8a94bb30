use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::loader::{join_name, CheckpointEntry};
use crate::quantization::quip::{select_rotation_block, E8P12_PACK};

/// Deterministic RNG for reproducible fixtures.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// F32 tensor with entries drawn uniformly from `[-scale, scale)`.
pub fn random_tensor(rng: &mut StdRng, shape: &[usize], scale: f32, device: &Device) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.gen_range(-scale..scale)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// `{prefix}.weight` of an unquantized `[out, in]` projection.
pub fn dense_linear_entries(
    prefix: &str,
    input_size: usize,
    output_size: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Vec<CheckpointEntry>> {
    let scale = 1.0 / (input_size as f32).sqrt();
    Ok(vec![CheckpointEntry::new(
        join_name(prefix, "weight"),
        random_tensor(rng, &[output_size, input_size], scale, device)?,
    )])
}

/// `Qidxs`, `SU` and `SV` of a QuIP# projection with random codes.
///
/// Codes cover the whole 16-bit range; scales have random sign and a
/// magnitude in `[0.5, 1.0)`.
pub fn quip_linear_entries(
    prefix: &str,
    input_size: usize,
    output_size: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Vec<CheckpointEntry>> {
    let padded_in = select_rotation_block(input_size, E8P12_PACK)?.padded;
    let padded_out = select_rotation_block(output_size, 1)?.padded;

    let codes: Vec<i64> = (0..padded_out * padded_in / E8P12_PACK)
        .map(|_| i64::from(rng.gen::<u16>()))
        .collect();
    let qidxs = Tensor::from_vec(codes, (padded_out, padded_in / E8P12_PACK), device)?;

    let mut signed_scales = |n: usize| -> Result<Tensor> {
        let data: Vec<f32> = (0..n)
            .map(|_| {
                let magnitude = rng.gen_range(0.5f32..1.0);
                if rng.gen::<bool>() {
                    magnitude
                } else {
                    -magnitude
                }
            })
            .collect();
        Ok(Tensor::from_vec(data, n, device)?)
    };
    let su = signed_scales(input_size)?;
    let sv = signed_scales(output_size)?;

    Ok(vec![
        CheckpointEntry::new(join_name(prefix, "Qidxs"), qidxs),
        CheckpointEntry::new(join_name(prefix, "SU"), su),
        CheckpointEntry::new(join_name(prefix, "SV"), sv),
    ])
}

/// HuggingFace-named unquantized weights of one sparse MLP under `prefix`
/// (e.g. `model.layers.0.mlp`): router gate, every expert, and the shared
/// expert with its gate when the config has one.
pub fn moe_layer_checkpoint(
    cfg: &ModelConfig,
    prefix: &str,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Vec<CheckpointEntry>> {
    let num_experts = cfg
        .num_experts()
        .ok_or_else(|| Error::config("config has no experts"))?;
    let hidden = cfg.hidden_size;
    let inter = cfg.moe_intermediate_size().unwrap_or(cfg.intermediate_size);

    let mut entries = dense_linear_entries(&join_name(prefix, "gate"), hidden, num_experts, rng, device)?;
    for e in 0..num_experts {
        let expert = join_name(prefix, &format!("experts.{e}"));
        entries.extend(dense_linear_entries(&join_name(&expert, "gate_proj"), hidden, inter, rng, device)?);
        entries.extend(dense_linear_entries(&join_name(&expert, "up_proj"), hidden, inter, rng, device)?);
        entries.extend(dense_linear_entries(&join_name(&expert, "down_proj"), inter, hidden, rng, device)?);
    }

    if let Some(shared) = cfg.shared_expert_intermediate_size() {
        let base = join_name(prefix, "shared_expert");
        entries.extend(dense_linear_entries(&join_name(&base, "gate_proj"), hidden, shared, rng, device)?);
        entries.extend(dense_linear_entries(&join_name(&base, "up_proj"), hidden, shared, rng, device)?);
        entries.extend(dense_linear_entries(&join_name(&base, "down_proj"), shared, hidden, rng, device)?);
        entries.extend(dense_linear_entries(
            &join_name(prefix, "shared_expert_gate"),
            hidden,
            1,
            rng,
            device,
        )?);
    }

    Ok(entries)
}
