pub mod linear;
pub mod mlp;

pub use linear::{MergedColumnLinear, ReplicatedLinear};
pub use mlp::{silu_and_mul, GatedMlp, SUPPORTED_ACTIVATION};
