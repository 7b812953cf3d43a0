//! # Distributed Data Parallelism
//!
//! Data parallelism replicates the *entire model* on every rank and splits the *dataset*. Each
//! rank computes gradients on its own shard; before the optimizer steps, gradients are averaged
//! across ranks with an **All-Reduce** so every replica applies the same update and the models
//! never drift apart.
//!
//! ## Module Contents
//!
//! *   [`CollectiveBackend`]: the interface for communication (all-reduce, all-gather,
//!     broadcast, join).
//! *   [`CpuBackend`]: a pure Rust Ring All-Reduce where every rank is a thread. Pair it with
//!     [`run_local_world`] to run a whole job inside one process.
//! *   [`DistributedOptimizer`]: wraps an optimizer so gradients are all-reduced exactly once per
//!     accumulation window.
//! *   [`broadcast`](mod@broadcast): helpers that copy parameters and optimizer state from a root
//!     rank so every replica starts identical.

pub mod backend;
pub mod broadcast;
pub mod cpu_backend;
pub mod launch;
pub mod optimizer;

pub use backend::{CollectiveBackend, CollectiveError, ProcessGroup, ReduceOp};
pub use broadcast::{broadcast_object, broadcast_optimizer_state, broadcast_parameters};
pub use cpu_backend::CpuBackend;
pub use launch::run_local_world;
pub use optimizer::{DistributedOptimizer, SkipSynchronizeGuard, SynchronizedOptimizer};
