//! Shared test utilities for qmoe-core.
//!
//! This module provides seeded tensor generators, synthetic checkpoint
//! builders and tiny model configurations for integration testing.

mod checkpoint;
mod tiny_config;

pub use checkpoint::{
    dense_linear_entries, moe_layer_checkpoint, quip_linear_entries, random_tensor, seeded_rng,
};
pub use tiny_config::{tiny_dense_config, tiny_moe_config};
