//! Criterion benchmarks for sparse MoE execution.
//!
//! Compares per-expert and fused execution of one block, plus routing
//! alone, on CPU with an unquantized backend.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device, Tensor};
use qmoe_core::config::ModelConfig;
use qmoe_core::distributed::ParallelContext;
use qmoe_core::loader::{CheckpointRemapper, ParameterRegistry};
use qmoe_core::moe::{topk_softmax, SparseMoeBlock, TopKNormalization};
use qmoe_core::quantization::{NoQuantizationConfig, QuantizationConfig};
use qmoe_core::testing::{moe_layer_checkpoint, random_tensor, seeded_rng};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PREFIX: &str = "mlp";

/// Qwen1.5-MoE-shaped block scaled down to keep setup fast.
fn bench_config() -> ModelConfig {
    let mut cfg = ModelConfig {
        hidden_size: 512,
        intermediate_size: 1408,
        num_hidden_layers: 1,
        ..Default::default()
    };
    cfg.extra.insert("num_experts".into(), 16.into());
    cfg.extra.insert("num_experts_per_tok".into(), 4.into());
    cfg.extra.insert("moe_intermediate_size".into(), 352.into());
    cfg.extra.insert("shared_expert_intermediate_size".into(), 1408.into());
    cfg
}

fn make_block(fused: bool) -> SparseMoeBlock {
    let cfg = bench_config();
    let quant: Arc<dyn QuantizationConfig> = Arc::new(NoQuantizationConfig::new(DType::F32));
    let block_cfg = cfg.moe_block_config(fused).expect("block config");
    let block = SparseMoeBlock::new(block_cfg, quant, ParallelContext::single(), DType::F32, &Device::Cpu)
        .expect("block");

    let mut registry = ParameterRegistry::new();
    block.register_parameters(PREFIX, &mut registry).expect("register");
    let entries = moe_layer_checkpoint(&cfg, PREFIX, &mut seeded_rng(0), &Device::Cpu).expect("checkpoint");
    CheckpointRemapper::qwen2_moe(16, block.uses_fused_experts())
        .load_weights(entries, &registry)
        .expect("load");
    block
}

fn make_input(tokens: usize, hidden: usize) -> Tensor {
    random_tensor(&mut seeded_rng(1), &[tokens, hidden], 1.0, &Device::Cpu).expect("input tensor")
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn bench_topk_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_topk_softmax");
    for &tokens in &[1usize, 64, 512] {
        let logits = make_input(tokens, 64);
        group.bench_with_input(BenchmarkId::new("tokens", tokens), &tokens, |b, _| {
            b.iter(|| {
                topk_softmax(black_box(&logits), 8, TopKNormalization::FullSoftmax)
                    .expect("topk failed")
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Block forward
// ---------------------------------------------------------------------------

fn bench_block_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_block_forward");
    group.sample_size(20);
    for fused in [false, true] {
        let block = make_block(fused);
        let mode = if fused { "fused" } else { "per_expert" };
        for &tokens in &[1usize, 32, 128] {
            let x = make_input(tokens, 512);
            let label = format!("{mode}_n{tokens}");
            group.bench_with_input(BenchmarkId::new("config", &label), &label, |b, _| {
                b.iter(|| block.forward(black_box(&x)).expect("forward failed"));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_topk_softmax, bench_block_forward);
criterion_main!(benches);
