//! Mixture of Experts (MoE) execution.
//!
//! This module provides:
//! - [`TopKRouter`] - gate linear plus deterministic top-k softmax routing
//! - [`ExpertShard`] - balanced placement of experts across ranks
//! - [`combine_dense`] - per-expert weighted combination
//! - [`FusedExperts`] - stacked expert weights for fused backends
//! - [`SparseMoeBlock`] - routing, combination, reduction and shared expert
//! - [`FeedForward`] - dense or sparse feed-forward per decoder layer

mod combiner;
mod expert;
mod feed_forward;
pub mod fused;
mod partition;
mod router;
mod sparse_block;
mod topk;

pub use combiner::{combine_dense, expert_token_weights};
pub use expert::{ExpertFeedForward, ExpertMlp};
pub use feed_forward::FeedForward;
pub use fused::{fused_moe_forward, FusedExperts, FusedMoeWeights};
pub use partition::{partition_experts, ExpertShard};
pub use router::{MoERouter, RouterConfig, RoutingDecision, TopKRouter};
pub use sparse_block::{MoEBlockConfig, SparseMoeBlock};
pub use topk::{topk_softmax, TopKNormalization};
