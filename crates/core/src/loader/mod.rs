//! Checkpoint loading: destinations, the registry that names them, and the
//! remapper that routes checkpoint tensors into them.
//!
//! Layers register their parameters under dotted names
//! (`model.layers.3.mlp.experts.7.up_proj.Qidxs`), then a single
//! [`CheckpointRemapper::load_weights`] pass streams the checkpoint in.

mod parameter;
mod registry;
mod remap;

pub use parameter::{
    stack_slots, ParamLayout, Parameter, ParameterLoader, ShardId, ShardSlot, ShardedParameter,
    SourceNarrow,
};
pub use registry::{join_name, ParameterRegistry};
pub use remap::{
    CheckpointEntry, CheckpointRemapper, LoadReport, RemapRule, Resolution, SkipReason,
    SkippedEntry,
};
