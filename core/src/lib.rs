//! # hvd-core
//!
//! `hvd-core` is the substrate a data-parallel training strategy drives: tensors, parameters
//! shared between a model and its optimizers, optimizers and learning-rate schedulers, and the
//! collective operations that keep replicas in sync.
//!
//! It runs on **CPU only**. Device tags on tensors record *where* a value would live on a real
//! cluster, and [`distributed::CpuBackend`] runs every rank as a thread in one process.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Dynamic-shape tensor and device descriptor.
//! - [`nn`]: The `Module` trait and shared `Parameter` handles.
//! - [`optim`]: Optimizers (SGD, AdamW) and learning-rate schedulers.
//! - [`distributed`]: Collective backends, gradient-synchronizing optimizer, state broadcast.
//! - [`data`]: Samplers, including the per-rank `DistributedSampler`.
//!
//! ## Example
//!
//! ```rust
//! use hvd_core::distributed::{run_local_world, CollectiveBackend, ReduceOp};
//! use hvd_core::Tensor;
//!
//! let means = run_local_world(2, 2, |backend| {
//!     backend.init().unwrap();
//!     let t = Tensor::<f32>::full(&[2], backend.rank() as f32);
//!     backend.allreduce(&t, ReduceOp::Average).unwrap()
//! })
//! .unwrap();
//! assert_eq!(means[0].data(), &[0.5, 0.5]);
//! ```

pub mod data;
pub mod distributed;
pub mod error;
pub mod nn;
pub mod optim;
pub mod tensor;

pub use error::{Error, Result};
pub use nn::{Module, Parameter};
pub use optim::Optimizer;
pub use tensor::{Device, Tensor, TensorElem, TensorError};
