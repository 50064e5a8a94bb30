//! Crate-level error type.
//!
//! Construction and load-time failures are fatal for bring-up: callers are
//! expected to abort rather than run with a partially configured model.
//! The per-step forward path reuses the same type so tensor and collective
//! failures propagate with `?`.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors raised by the quantized-linear and MoE execution core.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported quantization variant, sharding where unsupported, rank
    /// count exceeding expert count, empty local expert shard.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tensor geometry inconsistent with the declared feature counts.
    #[error("shape error: {0}")]
    Shape(String),

    /// A checkpoint entry references a destination that should exist but
    /// does not.
    #[error("load error: {0}")]
    Load(String),

    /// Collective communication failed.
    #[error(transparent)]
    Distributed(#[from] DistributedError),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
