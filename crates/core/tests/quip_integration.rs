//! Integration tests for the QuIP# backend.
//!
//! These tests cover config detection, layer creation through the backend
//! capability trait, checkpoint loading into split projections, and the
//! gemv/dequantize dispatch boundary. All CPU-only.

use std::sync::Arc;
use std::thread;

use candle_core::{DType, Device, Tensor};
use qmoe_core::{
    distributed::{in_process_group, ParallelContext},
    layers::{GatedMlp, ReplicatedLinear},
    loader::{join_name, CheckpointEntry, CheckpointRemapper, ParameterRegistry},
    moe::{MoEBlockConfig, SparseMoeBlock},
    quantization::{
        create_config, detect_from_json, quip::{QuipLinear, QuipWeightStore, GEMV_MAX_ROWS},
        LinearShape, QuantizationConfig, QuantizationMethod, QuantizedLinear, QuipConfig,
    },
    testing::{dense_linear_entries, quip_linear_entries, random_tensor, seeded_rng},
    Error,
};
use serde_json::json;

fn quip() -> QuipConfig {
    QuipConfig::new("E8P12", DType::F32).unwrap()
}

fn assert_close(actual: &Tensor, expected: &Tensor, tol: f32) {
    assert_eq!(actual.dims(), expected.dims());
    let a = actual.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let e = expected.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    for (a, e) in a.iter().zip(&e) {
        assert!((a - e).abs() <= tol * (1.0 + e.abs()), "got {a}, expected {e}");
    }
}

fn entry<'a>(entries: &'a [CheckpointEntry], name: &str) -> &'a Tensor {
    &entries
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("missing {name}"))
        .tensor
}

/// Standalone layer built directly from checkpoint tensors.
fn standalone(entries: &[CheckpointEntry], prefix: &str, codebook: &QuipConfig) -> QuipLinear {
    let store = QuipWeightStore::from_tensors(
        entry(entries, &join_name(prefix, "Qidxs")),
        entry(entries, &join_name(prefix, "SU")),
        entry(entries, &join_name(prefix, "SV")),
    )
    .unwrap();
    QuipLinear::new(store, None, Arc::clone(codebook.codebook()))
}

// ─── Detection ───────────────────────────────────────────────────────────────

#[test]
fn test_detect_and_create_quip_config() {
    let cfg = json!({
        "architectures": ["Qwen2MoeForCausalLM"],
        "quantization_config": {"quant_method": "quip", "codebook": "E8P12"}
    });
    let detected = detect_from_json(&cfg).unwrap();
    assert_eq!(detected.method, QuantizationMethod::Quip);
    assert_eq!(detected.codebook.as_deref(), Some("E8P12"));

    let config = create_config(&detected, DType::F16).unwrap();
    assert_eq!(config.method(), QuantizationMethod::Quip);
    assert!(!config.merge_weight());
    assert!(!config.supports_fused_moe());
    assert_eq!(config.min_capability(), 80);
    assert_eq!(config.supported_act_dtypes(), &[DType::F16]);
}

#[test]
fn test_unsupported_codebook_is_rejected() {
    let detected = detect_from_json(&json!({
        "quantization_config": {"quant_method": "quip", "codebook": "D4"}
    }))
    .unwrap();
    assert!(matches!(
        create_config(&detected, DType::F16),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_unknown_method_is_rejected() {
    let err = detect_from_json(&json!({"quantization_config": {"quant_method": "gptq"}}));
    assert!(matches!(err, Err(Error::Configuration(_))));
}

#[test]
fn test_partitioned_shape_is_rejected() {
    let shape = LinearShape::replicated(64, 64, false).with_partition(32, 64);
    let err = quip().create_linear(&shape, &Device::Cpu).err().unwrap();
    assert!(matches!(err, Error::Configuration(_)));
}

// ─── Replicated layer ────────────────────────────────────────────────────────

fn loaded_replicated(input: usize, output: usize, seed: u64) -> ReplicatedLinear {
    let layer = ReplicatedLinear::new(input, output, false, &quip(), &Device::Cpu).unwrap();
    let mut registry = ParameterRegistry::new();
    layer.register_parameters("proj", &mut registry).unwrap();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["proj.Qidxs", "proj.SU", "proj.SV"]);

    let entries = quip_linear_entries("proj", input, output, &mut seeded_rng(seed), &Device::Cpu).unwrap();
    let report = CheckpointRemapper::default().load_weights(entries, &registry).unwrap();
    assert!(report.is_complete());
    layer
}

#[test]
fn test_dispatch_boundary_agrees() {
    let layer = loaded_replicated(100, 96, 3);
    let rows = GEMV_MAX_ROWS + 8;
    let xs = random_tensor(&mut seeded_rng(4), &[rows, 100], 1.0, &Device::Cpu).unwrap();

    // Batched call takes the dequantize path, single rows take gemv.
    let batched = layer.forward(&xs).unwrap();
    let per_row: Vec<Tensor> = (0..rows)
        .map(|i| layer.forward(&xs.narrow(0, i, 1).unwrap()).unwrap())
        .collect();
    assert_close(&batched, &Tensor::cat(&per_row, 0).unwrap(), 1e-3);

    // Exactly at the threshold.
    let at = xs.narrow(0, 0, GEMV_MAX_ROWS).unwrap();
    let below = xs.narrow(0, 0, GEMV_MAX_ROWS - 1).unwrap();
    assert_close(
        &layer.forward(&below).unwrap(),
        &layer.forward(&at).unwrap().narrow(0, 0, GEMV_MAX_ROWS - 1).unwrap(),
        1e-3,
    );
}

#[test]
fn test_quantized_layer_is_linear() {
    let layer = loaded_replicated(64, 48, 5);
    let mut rng = seeded_rng(6);
    let x = random_tensor(&mut rng, &[3, 64], 1.0, &Device::Cpu).unwrap();
    let y = random_tensor(&mut rng, &[3, 64], 1.0, &Device::Cpu).unwrap();

    let combined = layer
        .forward(&(x.affine(2.0, 0.0).unwrap() + &y).unwrap())
        .unwrap();
    let separate = (layer.forward(&x).unwrap().affine(2.0, 0.0).unwrap()
        + layer.forward(&y).unwrap())
    .unwrap();
    assert_close(&combined, &separate, 1e-3);
}

#[test]
fn test_output_keeps_activation_dtype_and_leading_dims() {
    let layer = loaded_replicated(64, 48, 7);
    let xs = random_tensor(&mut seeded_rng(8), &[2, 3, 64], 1.0, &Device::Cpu)
        .unwrap()
        .to_dtype(DType::F16)
        .unwrap();
    let out = layer.forward(&xs).unwrap();
    assert_eq!(out.dims(), &[2, 3, 48]);
    assert_eq!(out.dtype(), DType::F16);
}

// ─── Split projections ───────────────────────────────────────────────────────

#[test]
fn test_gated_mlp_loads_split_gate_up() {
    let q = quip();
    let mlp = GatedMlp::new(64, 48, "silu", &q, &Device::Cpu).unwrap();
    let mut registry = ParameterRegistry::new();
    mlp.register_parameters("model.layers.0.mlp", &mut registry).unwrap();
    assert!(registry.contains("model.layers.0.mlp.gate_up_proj.Qidxs"));

    let mut rng = seeded_rng(9);
    let mut entries = Vec::new();
    entries.extend(quip_linear_entries("model.layers.0.mlp.gate_proj", 64, 48, &mut rng, &Device::Cpu).unwrap());
    entries.extend(quip_linear_entries("model.layers.0.mlp.up_proj", 64, 48, &mut rng, &Device::Cpu).unwrap());
    entries.extend(quip_linear_entries("model.layers.0.mlp.down_proj", 48, 64, &mut rng, &Device::Cpu).unwrap());

    let report = CheckpointRemapper::qwen2_moe(0, false)
        .load_weights(entries.clone(), &registry)
        .unwrap();
    assert!(report.is_complete(), "unloaded: {:?}", report.unloaded);

    let gate = standalone(&entries, "model.layers.0.mlp.gate_proj", &q);
    let up = standalone(&entries, "model.layers.0.mlp.up_proj", &q);
    let down = standalone(&entries, "model.layers.0.mlp.down_proj", &q);

    let xs = random_tensor(&mut seeded_rng(10), &[4, 64], 1.0, &Device::Cpu).unwrap();
    let act = (candle_nn::ops::silu(&gate.forward(&xs).unwrap()).unwrap()
        * up.forward(&xs).unwrap())
    .unwrap();
    let expected = down.forward(&act).unwrap();
    assert_close(&mlp.forward(&xs).unwrap(), &expected, 1e-3);
}

// ─── Quantized experts ───────────────────────────────────────────────────────

const MOE_PREFIX: &str = "model.layers.0.mlp";

fn quip_moe_config() -> MoEBlockConfig {
    MoEBlockConfig {
        num_experts: 4,
        top_k: 2,
        hidden_size: 64,
        expert_intermediate_size: 48,
        shared_expert_intermediate_size: Some(32),
        renormalize: true,
        fused_backend_available: true,
    }
}

fn quip_moe_checkpoint() -> Vec<CheckpointEntry> {
    let mut rng = seeded_rng(12);
    let d = Device::Cpu;
    let p = |name: &str| join_name(MOE_PREFIX, name);

    let mut entries = dense_linear_entries(&p("gate"), 64, 4, &mut rng, &d).unwrap();
    for e in 0..4 {
        entries.extend(quip_linear_entries(&p(&format!("experts.{e}.gate_proj")), 64, 48, &mut rng, &d).unwrap());
        entries.extend(quip_linear_entries(&p(&format!("experts.{e}.up_proj")), 64, 48, &mut rng, &d).unwrap());
        entries.extend(quip_linear_entries(&p(&format!("experts.{e}.down_proj")), 48, 64, &mut rng, &d).unwrap());
    }
    entries.extend(quip_linear_entries(&p("shared_expert.gate_proj"), 64, 32, &mut rng, &d).unwrap());
    entries.extend(quip_linear_entries(&p("shared_expert.up_proj"), 64, 32, &mut rng, &d).unwrap());
    entries.extend(quip_linear_entries(&p("shared_expert.down_proj"), 32, 64, &mut rng, &d).unwrap());
    entries.extend(dense_linear_entries(&p("shared_expert_gate"), 64, 1, &mut rng, &d).unwrap());
    entries
}

fn run_quip_moe(ctx: ParallelContext) -> Tensor {
    let quant: Arc<dyn QuantizationConfig> = Arc::new(quip());
    let block = SparseMoeBlock::new(quip_moe_config(), quant, ctx, DType::F32, &Device::Cpu).unwrap();
    // No fused kernel for QuIP#, whatever the platform offers.
    assert!(!block.uses_fused_experts());

    let mut registry = ParameterRegistry::new();
    block.register_parameters(MOE_PREFIX, &mut registry).unwrap();
    let report = CheckpointRemapper::qwen2_moe(4, false)
        .load_weights(quip_moe_checkpoint(), &registry)
        .unwrap();
    assert!(report.is_complete(), "unloaded: {:?}", report.unloaded);

    let xs = random_tensor(&mut seeded_rng(13), &[6, 64], 1.0, &Device::Cpu).unwrap();
    block.forward(&xs).unwrap()
}

#[test]
fn test_quip_experts_two_ranks_match_single() {
    let single = run_quip_moe(ParallelContext::single());
    assert_eq!(single.dims(), &[6, 64]);

    let handles: Vec<_> = in_process_group(2)
        .unwrap()
        .into_iter()
        .map(|comm| thread::spawn(move || run_quip_moe(ParallelContext::new(Arc::new(comm)).unwrap())))
        .collect();
    for handle in handles {
        assert_close(&handle.join().unwrap(), &single, 1e-3);
    }
}
