//! Checkpoint name remapping.
//!
//! Checkpoints store one tensor per original projection
//! (`self_attn.q_proj.weight`, `mlp.experts.3.up_proj.weight`, ...) while the
//! runtime packs several of them into one destination. Each entry of the
//! checkpoint stream is resolved against three ordered rule tiers, first
//! match wins:
//!
//! 1. stacked projections, rewritten to the packed destination plus a shard id
//! 2. per-expert projections, rewritten to the fused expert weights plus a
//!    shard id and an expert id (only when experts run through a fused backend)
//! 3. the verbatim name, loaded as a whole tensor
//!
//! Some misses are expected and skipped: rotary inverse frequencies are
//! recomputed at runtime, bias tensors exist for projections built without
//! bias, and expert weights belong to experts owned by another rank.

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::parameter::ShardId;
use super::registry::ParameterRegistry;

/// One tensor of the checkpoint stream.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub name: String,
    pub tensor: Tensor,
    /// Shard id carried by the stream itself, forwarded on default loads.
    pub shard: Option<ShardId>,
}

impl CheckpointEntry {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
            shard: None,
        }
    }

    pub fn with_shard(mut self, shard: ShardId) -> Self {
        self.shard = Some(shard);
        self
    }
}

/// Rewrite `source` to `destination` when it appears as whole dotted
/// segments of a checkpoint name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    pub destination: String,
    pub source: String,
    pub shard: Option<ShardId>,
    pub expert_id: Option<usize>,
}

impl RemapRule {
    pub fn stacked(destination: &str, source: &str, shard: ShardId) -> Self {
        Self {
            destination: destination.to_string(),
            source: source.to_string(),
            shard: Some(shard),
            expert_id: None,
        }
    }

    pub fn expert(
        destination: &str,
        source: impl Into<String>,
        shard: Option<ShardId>,
        expert_id: usize,
    ) -> Self {
        Self {
            destination: destination.to_string(),
            source: source.into(),
            shard,
            expert_id: Some(expert_id),
        }
    }

    /// The rewritten name, or `None` if the rule does not apply.
    pub fn rewrite(&self, name: &str) -> Option<String> {
        let start = find_segment(name, &self.source)?;
        let end = start + self.source.len();
        Some(format!("{}{}{}", &name[..start], self.destination, &name[end..]))
    }
}

/// Byte offset of the first occurrence of `pattern` bounded by `.` or the
/// ends of `name`. `experts.1.up_proj` must not match inside
/// `experts.11.up_proj`.
fn find_segment(name: &str, pattern: &str) -> Option<usize> {
    if pattern.is_empty() {
        return None;
    }
    let bytes = name.as_bytes();
    name.match_indices(pattern).map(|(idx, _)| idx).find(|&idx| {
        let end = idx + pattern.len();
        let starts_clean = idx == 0 || bytes[idx - 1] == b'.';
        let ends_clean = end == bytes.len() || bytes[end] == b'.';
        starts_clean && ends_clean
    })
}

/// Where a checkpoint name goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Stacked {
        destination: String,
        shard: ShardId,
    },
    Expert {
        destination: String,
        shard: Option<ShardId>,
        expert_id: usize,
    },
    Default {
        destination: String,
    },
    /// Recomputed at runtime; never loaded.
    Ignored,
}

/// Why an entry was not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RotaryInvFreq,
    OrphanBias,
    ExpertNotOwned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of one load pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Destination names written, in stream order (repeats for stacked
    /// destinations written once per shard).
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
    /// Registered destinations left with unwritten slots.
    pub unloaded: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.unloaded.is_empty()
    }

    pub fn skipped_with(&self, reason: SkipReason) -> impl Iterator<Item = &str> {
        self.skipped
            .iter()
            .filter(move |s| s.reason == reason)
            .map(|s| s.name.as_str())
    }
}

/// Declarative checkpoint remapper.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRemapper {
    stacked: Vec<RemapRule>,
    experts: Vec<RemapRule>,
}

impl CheckpointRemapper {
    pub fn new(stacked: Vec<RemapRule>, experts: Vec<RemapRule>) -> Self {
        Self { stacked, experts }
    }

    /// Rule set for Qwen2-MoE style checkpoints.
    ///
    /// Expert rules are only installed when experts run through a fused
    /// backend; otherwise expert weights load verbatim into per-expert MLPs.
    pub fn qwen2_moe(num_experts: usize, fused_experts: bool) -> Self {
        let stacked = vec![
            RemapRule::stacked("qkv_proj", "q_proj", ShardId::Q),
            RemapRule::stacked("qkv_proj", "k_proj", ShardId::K),
            RemapRule::stacked("qkv_proj", "v_proj", ShardId::V),
            RemapRule::stacked("mlp.gate_up_proj", "mlp.gate_proj", ShardId::Index(0)),
            RemapRule::stacked("mlp.gate_up_proj", "mlp.up_proj", ShardId::Index(1)),
            RemapRule::stacked(
                "shared_expert.gate_up_proj",
                "shared_expert.gate_proj",
                ShardId::Index(0),
            ),
            RemapRule::stacked(
                "shared_expert.gate_up_proj",
                "shared_expert.up_proj",
                ShardId::Index(1),
            ),
        ];

        let experts = if fused_experts {
            (0..num_experts)
                .flat_map(|e| {
                    [
                        RemapRule::expert(
                            "w1",
                            format!("experts.{e}.gate_proj"),
                            Some(ShardId::Index(0)),
                            e,
                        ),
                        RemapRule::expert(
                            "w1",
                            format!("experts.{e}.up_proj"),
                            Some(ShardId::Index(1)),
                            e,
                        ),
                        RemapRule::expert("w2", format!("experts.{e}.down_proj"), None, e),
                    ]
                })
                .collect()
        } else {
            Vec::new()
        };

        Self { stacked, experts }
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        if name.contains("rotary_emb.inv_freq") {
            return Resolution::Ignored;
        }
        for rule in &self.stacked {
            if let (Some(destination), Some(shard)) = (rule.rewrite(name), rule.shard) {
                return Resolution::Stacked { destination, shard };
            }
        }
        for rule in &self.experts {
            if let (Some(destination), Some(expert_id)) = (rule.rewrite(name), rule.expert_id) {
                return Resolution::Expert {
                    destination,
                    shard: rule.shard,
                    expert_id,
                };
            }
        }
        Resolution::Default {
            destination: name.to_string(),
        }
    }

    /// Stream every entry into the registry.
    ///
    /// Any miss that is not an expected skip aborts the load.
    pub fn load_weights<I>(&self, entries: I, registry: &ParameterRegistry) -> Result<LoadReport>
    where
        I: IntoIterator<Item = CheckpointEntry>,
    {
        let mut report = LoadReport::default();

        for entry in entries {
            let (destination, shard, expert_id, expert_skip_allowed) =
                match self.resolve(&entry.name) {
                    Resolution::Ignored => {
                        debug!(name = %entry.name, "skipping rotary inverse frequencies");
                        report.skipped.push(SkippedEntry {
                            name: entry.name,
                            reason: SkipReason::RotaryInvFreq,
                        });
                        continue;
                    }
                    Resolution::Stacked { destination, shard } => {
                        (destination, Some(shard), None, true)
                    }
                    Resolution::Expert {
                        destination,
                        shard,
                        expert_id,
                    } => (destination, shard, Some(expert_id), false),
                    Resolution::Default { destination } => {
                        (destination, entry.shard, None, true)
                    }
                };

            let Some(param) = registry.get(&destination) else {
                let reason = skip_reason(&destination, expert_skip_allowed).ok_or_else(|| {
                    Error::load(format!(
                        "checkpoint tensor '{}' has no destination '{destination}'",
                        entry.name
                    ))
                })?;
                debug!(name = %entry.name, %destination, ?reason, "skipping checkpoint tensor");
                report.skipped.push(SkippedEntry {
                    name: entry.name,
                    reason,
                });
                continue;
            };

            param
                .load(&entry.tensor, shard, expert_id)
                .map_err(|e| with_destination(e, &entry.name, &destination))?;
            report.loaded.push(destination);
        }

        report.unloaded = registry.unloaded().into_iter().map(str::to_string).collect();
        for name in &report.unloaded {
            warn!(parameter = %name, "parameter not fully initialized from checkpoint");
        }
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            unloaded = report.unloaded.len(),
            "checkpoint load finished"
        );
        Ok(report)
    }
}

fn skip_reason(destination: &str, expert_skip_allowed: bool) -> Option<SkipReason> {
    if destination.ends_with(".bias") {
        Some(SkipReason::OrphanBias)
    } else if expert_skip_allowed
        && (destination.contains("mlp.experts.") || destination.contains("mlp.shared_expert."))
    {
        Some(SkipReason::ExpertNotOwned)
    } else {
        None
    }
}

fn with_destination(err: Error, name: &str, destination: &str) -> Error {
    match err {
        Error::Shape(msg) => Error::Shape(format!("{name} -> {destination}: {msg}")),
        Error::Load(msg) => Error::Load(format!("{name} -> {destination}: {msg}")),
        other => other,
    }
}
