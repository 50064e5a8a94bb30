pub mod config;
pub mod distributed;
pub mod error;
pub mod layers;
pub mod loader;
pub mod moe;
pub mod quantization;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
