//! Distributed computing abstractions for expert-sharded MoE execution.
//!
//! This module provides:
//! - [`ProcessGroup`] - rank identity within a group
//! - [`DeviceCommunicator`] - collective operations (all_reduce, barrier)
//! - [`ParallelContext`] - rank + group handle passed to every constructor
//! - [`in_process_group`] - a thread-backed group used to run several ranks
//!   in one process
//!
//! # Architecture
//!
//! - Single rank: all collectives are identity (`world_size == 1` bypass)
//! - Multiple ranks: a blocking all-reduce at fixed points of the step; every
//!   rank must issue the same collectives in the same order
//!
//! # Usage
//!
//! ```ignore
//! use qmoe_core::distributed::ParallelContext;
//!
//! let ctx = ParallelContext::single();
//! assert_eq!(ctx.world_size(), 1);
//! ```

mod communicator;
mod error;
mod in_process;
mod parallel_context;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
pub use error::DistributedError;
pub use in_process::{in_process_group, InProcessCommunicator};
pub use parallel_context::ParallelContext;
pub use process_group::{LocalProcessGroup, ProcessGroup};
